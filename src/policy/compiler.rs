//! Policy compilation.
//!
//! The policy runtime does not interpret policies itself; it hands each
//! `PolicyRecord` to a `PolicyCompiler` and caches whatever executable handle
//! comes back.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::error::{ServiceCacheError, ServiceCacheResult};
use crate::core::types::{PolicyId, PolicyRecord};

/// Executable form of a policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompiledPolicy {
    pub policy_id: PolicyId,
    pub version: u64,
    /// Identifies the compiled content, not just the version number
    pub unique_version: String,
    /// Name of the policy document's root element
    pub root_element: String,
    pub compiled_at: DateTime<Utc>,
}

/// Builds executable policies from their stored form
pub trait PolicyCompiler: Send + Sync {
    fn compile(&self, policy: &PolicyRecord) -> ServiceCacheResult<CompiledPolicy>;
}

/// Compiler that accepts any well-formed single-root XML element
///
/// It checks that the document is one element whose start and end tags agree
/// and derives the unique version from a blake3 digest of the content.
#[derive(Debug, Clone, Default)]
pub struct BasicPolicyCompiler;

impl PolicyCompiler for BasicPolicyCompiler {
    fn compile(&self, policy: &PolicyRecord) -> ServiceCacheResult<CompiledPolicy> {
        let document = policy.xml.trim();
        if document.is_empty() {
            return Err(ServiceCacheError::policy_compile(policy.id, "policy document is empty"));
        }

        let root_element = root_element_name(document)
            .ok_or_else(|| ServiceCacheError::policy_compile(policy.id, "policy document has no root element"))?;

        let self_closing = document.ends_with("/>") && document.matches('<').count() == 1;
        let closing_tag = format!("</{}>", root_element);
        if !self_closing && !document.ends_with(&closing_tag) {
            return Err(ServiceCacheError::policy_compile(
                policy.id,
                format!("root element <{}> is not closed", root_element),
            ));
        }

        Ok(CompiledPolicy {
            policy_id: policy.id,
            version: policy.version,
            unique_version: unique_version(policy),
            root_element,
            compiled_at: Utc::now(),
        })
    }
}

fn root_element_name(document: &str) -> Option<String> {
    let rest = document.strip_prefix('<')?;
    let name: String = rest
        .chars()
        .take_while(|c| !c.is_whitespace() && *c != '>' && *c != '/')
        .collect();

    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, ':' | '-' | '_' | '.'));

    valid.then_some(name)
}

/// `<version>-<first 16 hex chars of blake3(xml)>`
pub fn unique_version(policy: &PolicyRecord) -> String {
    let digest = blake3::hash(policy.xml.as_bytes()).to_hex();
    let short: String = digest.chars().take(16).collect();
    format!("{}-{}", policy.version, short)
}
