//! IPC authorization model
//!
//! Every request on the local IPC socket carries a context describing how
//! the caller was authenticated. Reads require a trusted caller or an
//! authenticated member of a reader group; writes require a trusted caller
//! or an authenticated member of an admin group. Per-vserver operations
//! additionally consult the vserver's access-grant list.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How an IPC caller was authenticated
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AuthType {
    /// Local caller with the same UID as the engine
    Trusted,
    /// Remote caller authenticated by single sign-on
    Sso,
    /// Caller presented credentials that could not be verified
    Untrusted,
    /// No credentials presented
    None,
}

/// Group names that gate reads and writes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AccessPolicy {
    pub reader_groups: Vec<String>,
    pub admin_groups: Vec<String>,
}

/// Authenticated identity of an IPC caller
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthContext {
    pub auth_type: AuthType,
    pub user: Option<String>,
    pub groups: Vec<String>,
}

impl AuthContext {
    pub fn trusted() -> Self {
        Self {
            auth_type: AuthType::Trusted,
            user: None,
            groups: Vec::new(),
        }
    }

    pub fn anonymous() -> Self {
        Self {
            auth_type: AuthType::None,
            user: None,
            groups: Vec::new(),
        }
    }

    fn authenticated(&self) -> bool {
        matches!(self.auth_type, AuthType::Trusted | AuthType::Sso)
    }

    fn in_any(&self, groups: &[String]) -> bool {
        self.groups.iter().any(|g| groups.contains(g))
    }

    /// Check read access against the policy.
    pub fn authorize_read(&self, policy: &AccessPolicy) -> Result<()> {
        if self.auth_type == AuthType::Trusted {
            return Ok(());
        }
        if self.authenticated() && self.in_any(&policy.reader_groups) {
            return Ok(());
        }
        Err(Error::Auth("caller lacks read access".to_string()))
    }

    /// Check write access against the policy.
    pub fn authorize_write(&self, policy: &AccessPolicy) -> Result<()> {
        if self.auth_type == AuthType::Trusted {
            return Ok(());
        }
        if self.authenticated() && self.in_any(&policy.admin_groups) {
            return Ok(());
        }
        Err(Error::Auth("caller lacks write access".to_string()))
    }

    /// Check a per-vserver operation against the vserver's grant list in
    /// addition to the global write policy. Trusted callers and global
    /// admins bypass the grant list.
    pub fn authorize_vserver(&self, policy: &AccessPolicy, grants: &[String]) -> Result<()> {
        if self.auth_type == AuthType::Trusted {
            return Ok(());
        }
        if !self.authenticated() {
            return Err(Error::Auth("caller is not authenticated".to_string()));
        }
        if self.in_any(&policy.admin_groups) || self.in_any(grants) {
            return Ok(());
        }
        Err(Error::Auth(
            "caller is not granted access to this vserver".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> AccessPolicy {
        AccessPolicy {
            reader_groups: vec!["lb-readers".to_string()],
            admin_groups: vec!["lb-admins".to_string()],
        }
    }

    fn sso(groups: &[&str]) -> AuthContext {
        AuthContext {
            auth_type: AuthType::Sso,
            user: Some("operator".to_string()),
            groups: groups.iter().map(|g| g.to_string()).collect(),
        }
    }

    #[test]
    fn test_trusted_caller_can_do_everything() {
        let ctx = AuthContext::trusted();
        assert!(ctx.authorize_read(&policy()).is_ok());
        assert!(ctx.authorize_write(&policy()).is_ok());
        assert!(ctx.authorize_vserver(&policy(), &[]).is_ok());
    }

    #[test]
    fn test_reader_group_reads_but_cannot_write() {
        let ctx = sso(&["lb-readers"]);
        assert!(ctx.authorize_read(&policy()).is_ok());
        assert!(ctx.authorize_write(&policy()).is_err());
    }

    #[test]
    fn test_anonymous_caller_is_rejected() {
        let ctx = AuthContext::anonymous();
        assert!(ctx.authorize_read(&policy()).is_err());
        assert!(ctx.authorize_write(&policy()).is_err());
    }

    #[test]
    fn test_vserver_grant_allows_scoped_write() {
        let ctx = sso(&["web-team"]);
        let grants = vec!["web-team".to_string()];
        assert!(ctx.authorize_vserver(&policy(), &grants).is_ok());
        assert!(ctx.authorize_vserver(&policy(), &[]).is_err());
    }
}
