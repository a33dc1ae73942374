use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Which field of the owning book a transferred file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Purpose {
    Cover,
    Interior,
    MediaKit,
    Marketing,
}

/// Names of the book record fields a finished transfer is written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurposeFields {
    pub file_id: &'static str,
    pub file_name: &'static str,
    pub file_link: &'static str,
}

impl Purpose {
    /// All known purposes.
    pub const ALL: [Purpose; 4] = [
        Purpose::Cover,
        Purpose::Interior,
        Purpose::MediaKit,
        Purpose::Marketing,
    ];

    /// Wire name of the purpose.
    pub fn as_str(self) -> &'static str {
        match self {
            Purpose::Cover => "cover",
            Purpose::Interior => "interior",
            Purpose::MediaKit => "mediaKit",
            Purpose::Marketing => "marketing",
        }
    }

    /// Record fields patched when a transfer for this purpose completes.
    pub fn fields(self) -> PurposeFields {
        match self {
            Purpose::Cover => PurposeFields {
                file_id: "coverFileId",
                file_name: "coverFileName",
                file_link: "coverFileLink",
            },
            Purpose::Interior => PurposeFields {
                file_id: "interiorFileId",
                file_name: "interiorFileName",
                file_link: "interiorFileLink",
            },
            Purpose::MediaKit => PurposeFields {
                file_id: "mediaKitFileId",
                file_name: "mediaKitFileName",
                file_link: "mediaKitFileLink",
            },
            Purpose::Marketing => PurposeFields {
                file_id: "marketingFileId",
                file_name: "marketingFileName",
                file_link: "marketingFileLink",
            },
        }
    }

    /// Returns `true` if a file of `mime_type` may be stored under this purpose.
    ///
    /// Covers must be images; interiors must be PDF or EPUB.
    pub fn accepts_mime(self, mime_type: &str) -> bool {
        match self {
            Purpose::Cover => mime_type.starts_with("image/"),
            Purpose::Interior => {
                matches!(mime_type, "application/pdf" | "application/epub+zip")
            }
            Purpose::MediaKit | Purpose::Marketing => true,
        }
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing a purpose string that is not in [`Purpose::ALL`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown purpose: {0}")]
pub struct UnknownPurpose(pub String);

impl FromStr for Purpose {
    type Err = UnknownPurpose;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Purpose::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| UnknownPurpose(s.to_string()))
    }
}

/// Caller-declared description of a file to upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    pub name: String,
    pub mime_type: String,
    pub size: u64,
}

/// Error classes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    Unauthorized,
    FailedPrecondition,
    UpstreamFailure,
}

impl ErrorKind {
    /// Closest HTTP status for transports that need one.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::InvalidArgument => 400,
            ErrorKind::Unauthorized => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::FailedPrecondition => 409,
            ErrorKind::UpstreamFailure => 502,
        }
    }
}

/// Structured error payload returned instead of a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}
