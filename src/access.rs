//! Identity and access model shared by the exporter and the reconciler
//!
//! Everything here is plain data: access levels, site modes, project types
//! and the fixed role vocabulary. All enums are stored as TEXT in SQLite and
//! serialized with the same names on the wire.

use serde::{Deserialize, Serialize};

/// Separator between user name and directory domain in federated usernames
pub const DOMAIN_SEPARATOR: char = '@';

/// Whether a username belongs to a directory-sourced (federated) identity
pub fn is_directory_username(username: &str) -> bool {
    username.contains(DOMAIN_SEPARATOR)
}

/// Implements `as_str`, `Display`, `FromStr` and SQLite TEXT conversion
/// for a fieldless enum
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ::std::str::FromStr for $name {
            type Err = $crate::error::SyncError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err($crate::error::SyncError::Internal(format!(
                        "Invalid {} value: {}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }

        impl ::rusqlite::types::ToSql for $name {
            fn to_sql(&self) -> ::rusqlite::Result<::rusqlite::types::ToSqlOutput<'_>> {
                Ok(::rusqlite::types::ToSqlOutput::from(self.as_str()))
            }
        }

        impl ::rusqlite::types::FromSql for $name {
            fn column_result(
                value: ::rusqlite::types::ValueRef<'_>,
            ) -> ::rusqlite::types::FromSqlResult<Self> {
                let text = value.as_str()?;
                text.parse()
                    .map_err(|e: $crate::error::SyncError| {
                        ::rusqlite::types::FromSqlError::Other(Box::new(e))
                    })
            }
        }
    };
}

/// Graduated disclosure of a project to a remote site
///
/// Variants are ordered by disclosure. `Revoked` sorts last: it is reached
/// from a previously shared state and keeps only owner/delegate roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessLevel {
    None,
    ViewAvailability,
    ReadInfo,
    ReadRoles,
    Revoked,
}

text_enum!(AccessLevel {
    None => "NONE",
    ViewAvailability => "VIEW_AVAILABILITY",
    ReadInfo => "READ_INFO",
    ReadRoles => "READ_ROLES",
    Revoked => "REVOKED",
});

impl AccessLevel {
    /// Levels at which project details (title, readme, ancestors) are shared
    pub fn shares_info(&self) -> bool {
        matches!(
            self,
            AccessLevel::ReadInfo | AccessLevel::ReadRoles | AccessLevel::Revoked
        )
    }

    /// Levels at which role data is shared and reconciled
    pub fn shares_roles(&self) -> bool {
        matches!(self, AccessLevel::ReadRoles | AccessLevel::Revoked)
    }

    /// Levels which make a site a peer candidate for other sites
    pub fn is_peer_visible(&self) -> bool {
        matches!(self, AccessLevel::ReadInfo | AccessLevel::ReadRoles)
    }

    /// Whether an edge may move from `self` to `to`
    ///
    /// Revocation only applies to something that was shared before, so
    /// `NONE -> REVOKED` is the one forbidden edge.
    pub fn can_transition(&self, to: AccessLevel) -> bool {
        !(*self == AccessLevel::None && to == AccessLevel::Revoked)
    }
}

/// Role a remote site plays relative to this site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SiteMode {
    Source,
    Target,
    Peer,
}

text_enum!(SiteMode {
    Source => "SOURCE",
    Target => "TARGET",
    Peer => "PEER",
});

/// Project tree node type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProjectType {
    Category,
    Project,
}

text_enum!(ProjectType {
    Category => "CATEGORY",
    Project => "PROJECT",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmitStatus {
    Ok,
    Pending,
    PendingRemote,
}

text_enum!(SubmitStatus {
    Ok => "OK",
    Pending => "PENDING",
    PendingRemote => "PENDING_REMOTE",
});

/// Fixed role vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoleName {
    #[serde(rename = "project owner")]
    Owner,
    #[serde(rename = "project delegate")]
    Delegate,
    #[serde(rename = "project contributor")]
    Contributor,
    #[serde(rename = "project guest")]
    Guest,
}

text_enum!(RoleName {
    Owner => "project owner",
    Delegate => "project delegate",
    Contributor => "project contributor",
    Guest => "project guest",
});

impl RoleName {
    pub const ALL: [RoleName; 4] = [
        RoleName::Owner,
        RoleName::Delegate,
        RoleName::Contributor,
        RoleName::Guest,
    ];

    /// Lower rank means more privileges
    pub fn rank(&self) -> i64 {
        match self {
            RoleName::Owner => 10,
            RoleName::Delegate => 20,
            RoleName::Contributor => 30,
            RoleName::Guest => 40,
        }
    }

    /// Roles still disclosed for revoked projects
    pub fn is_privileged(&self) -> bool {
        matches!(self, RoleName::Owner | RoleName::Delegate)
    }
}
