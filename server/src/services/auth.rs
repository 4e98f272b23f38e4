//! Staff identity and board access.
//!
//! DESIGN
//! ======
//! Staff sessions are configured as `user:role:token` triples. Only the
//! SHA-256 digest of each token is kept in memory; lookups hash the
//! presented token and compare digests. Sessions without a recognised
//! token are anonymous.
//!
//! Public boards are open to everyone; staff boards require any staff role.
//! A post may carry an `auth` claim naming a role, which is honoured only if
//! the poster's identity holds that role or a higher one.

use std::collections::{HashMap, HashSet};
use std::fmt::Write;
use std::str::FromStr;

use sha2::{Digest, Sha256};

/// Staff roles, ordered by privilege.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Role {
    Janitor,
    Moderator,
    BoardOwner,
    Admin,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Janitor => "janitor",
            Self::Moderator => "moderator",
            Self::BoardOwner => "board_owner",
            Self::Admin => "admin",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "janitor" => Ok(Self::Janitor),
            "moderator" => Ok(Self::Moderator),
            "board_owner" => Ok(Self::BoardOwner),
            "admin" => Ok(Self::Admin),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Identity {
    Anonymous,
    Staff { user_id: String, role: Role },
}

impl Identity {
    #[must_use]
    pub fn role(&self) -> Option<Role> {
        match self {
            Self::Anonymous => None,
            Self::Staff { role, .. } => Some(*role),
        }
    }
}

pub(crate) fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

/// Hex SHA-256 digest of a session token.
#[must_use]
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    bytes_to_hex(&hasher.finalize())
}

// =============================================================================
// STAFF DIRECTORY
// =============================================================================

#[derive(Debug, Default)]
pub struct StaffDirectory {
    by_digest: HashMap<String, (String, Role)>,
}

impl StaffDirectory {
    /// Parse `user:role:token` triples separated by commas. Malformed
    /// entries are skipped with a warning.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let mut by_digest = HashMap::new();
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let mut parts = entry.splitn(3, ':');
            let (Some(user), Some(role), Some(token)) = (parts.next(), parts.next(), parts.next()) else {
                tracing::warn!("staff session entry is not user:role:token, skipping");
                continue;
            };
            match role.parse::<Role>() {
                Ok(role) if !user.is_empty() && !token.is_empty() => {
                    by_digest.insert(hash_token(token), (user.to_owned(), role));
                }
                Ok(_) => tracing::warn!(user, "staff session entry has empty fields, skipping"),
                Err(e) => tracing::warn!(user, error = %e, "staff session entry skipped"),
            }
        }
        Self { by_digest }
    }

    /// Resolve a presented session token.
    #[must_use]
    pub fn identify(&self, token: &str) -> Option<Identity> {
        self.by_digest
            .get(&hash_token(token))
            .map(|(user_id, role)| Identity::Staff { user_id: user_id.clone(), role: *role })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_digest.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_digest.is_empty()
    }
}

// =============================================================================
// BOARD ACCESS
// =============================================================================

#[derive(Debug, Default)]
pub struct BoardAccess {
    public: HashSet<String>,
    staff: HashSet<String>,
}

impl BoardAccess {
    #[must_use]
    pub fn new(public: &[String], staff: &[String]) -> Self {
        Self { public: public.iter().cloned().collect(), staff: staff.iter().cloned().collect() }
    }

    /// Whether `identity` may sync to and post on `board`.
    #[must_use]
    pub fn can_access(&self, identity: &Identity, board: &str) -> bool {
        if self.public.contains(board) {
            return true;
        }
        self.staff.contains(board) && identity.role().is_some()
    }
}

/// Resolve the identity backing a post's staff `claim`.
///
/// `session_token` is the token attached to the request, used when the
/// connection itself carried no staff cookie.
///
/// # Errors
///
/// Returns a message if the claim names an unknown role or the identity does
/// not hold it.
pub fn authorize_claim(
    identity: &Identity,
    claim: &str,
    session_token: Option<&str>,
    directory: &StaffDirectory,
) -> Result<Role, String> {
    let wanted: Role = claim.parse()?;
    let effective = match identity {
        Identity::Staff { .. } => identity.clone(),
        Identity::Anonymous => session_token
            .and_then(|token| directory.identify(token))
            .unwrap_or(Identity::Anonymous),
    };
    match effective.role() {
        Some(held) if held >= wanted => Ok(wanted),
        Some(held) => Err(format!("role {} cannot post as {}", held.as_str(), wanted.as_str())),
        None => Err(format!("staff claim {} requires a staff session", wanted.as_str())),
    }
}

#[cfg(test)]
#[path = "auth_test.rs"]
mod tests;
