//! Annotations: named metadata markers inserted into the event log at the
//! current position.
//!
//! An annotation is identified by a name and a detail. A missing detail is
//! the same as the empty detail. Names starting with `u-` are reserved for
//! annotations the recorder itself emits.

use crate::errors::RecorderError;
use serde::{Deserialize, Serialize};

pub const RESERVED_NAME_PREFIX: &str = "u-";

/// Type of textual annotation content. Numeric codes are shared with the
/// replay side and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    UnstructuredText = 100,
    Json = 101,
    Xml = 102,
}

impl ContentType {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Result<Self, RecorderError> {
        match code {
            100 => Ok(Self::UnstructuredText),
            101 => Ok(Self::Json),
            102 => Ok(Self::Xml),
            other => Err(RecorderError::InvalidArgument(format!(
                "unknown annotation content type {other}"
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnstructuredText => "text",
            Self::Json => "json",
            Self::Xml => "xml",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnnotationContent {
    None,
    Raw { bytes: Vec<u8> },
    Text { content_type: ContentType, text: String },
    Int { value: i64 },
}

impl AnnotationContent {
    pub fn raw(data: Option<&[u8]>) -> Self {
        match data {
            Some(bytes) => Self::Raw {
                bytes: bytes.to_vec(),
            },
            None => Self::None,
        }
    }

    pub fn text(content_type: ContentType, text: Option<&str>) -> Result<Self, RecorderError> {
        let Some(text) = text else {
            return Ok(Self::None);
        };
        if text.contains('\0') {
            return Err(RecorderError::InvalidArgument(
                "text annotations cannot contain NUL bytes; store them as raw data".to_string(),
            ));
        }
        Ok(Self::Text {
            content_type,
            text: text.to_string(),
        })
    }
}

/// An annotation as requested by a caller, before it is placed in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationRequest {
    pub name: String,
    pub detail: String,
    pub content: AnnotationContent,
}

impl AnnotationRequest {
    /// Builds a request for a caller-supplied name.
    pub fn user(
        name: &str,
        detail: Option<&str>,
        content: AnnotationContent,
    ) -> Result<Self, RecorderError> {
        validate_user_name(name)?;
        Ok(Self {
            name: name.to_string(),
            detail: detail.unwrap_or_default().to_string(),
            content,
        })
    }

    pub(crate) fn internal(name: &str, detail: &str, content: AnnotationContent) -> Self {
        Self {
            name: name.to_string(),
            detail: detail.to_string(),
            content,
        }
    }
}

/// A recorded annotation, immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub name: String,
    pub detail: String,
    pub content: AnnotationContent,
}

impl From<AnnotationRequest> for Annotation {
    fn from(request: AnnotationRequest) -> Self {
        Self {
            name: request.name,
            detail: request.detail,
            content: request.content,
        }
    }
}

fn validate_user_name(name: &str) -> Result<(), RecorderError> {
    if name.is_empty() {
        return Err(RecorderError::InvalidArgument(
            "annotation name must not be empty".to_string(),
        ));
    }
    if name.starts_with(RESERVED_NAME_PREFIX) {
        return Err(RecorderError::InvalidArgument(format!(
            "annotation names starting with {RESERVED_NAME_PREFIX:?} are reserved: {name}"
        )));
    }
    if name.contains('\0') {
        return Err(RecorderError::InvalidArgument(
            "annotation name contains a NUL byte".to_string(),
        ));
    }
    Ok(())
}
