use thiserror::Error;

/// Errors produced while turning a manifest document into the data model.
///
/// A parse error is always fatal for the document being parsed: no partial
/// [`crate::Manifest`] is ever returned alongside it.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("missing mandatory header `{expected}`")]
    MissingHeader { expected: &'static str },

    #[error("malformed XML: {reason}")]
    Xml { reason: String },

    #[error("invalid value `{value}` for `{attribute}`")]
    InvalidAttribute { attribute: String, value: String },

    #[error("unsupported document: {reason}")]
    Unsupported { reason: String },

    #[error("document is not valid UTF-8")]
    Encoding,

    #[error("{protocol} document contains no playable representation")]
    Empty { protocol: &'static str },
}

impl ParseError {
    pub fn xml(reason: impl Into<String>) -> Self {
        Self::Xml {
            reason: reason.into(),
        }
    }

    pub fn invalid_attribute(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Self::InvalidAttribute {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    pub fn unsupported(reason: impl Into<String>) -> Self {
        Self::Unsupported {
            reason: reason.into(),
        }
    }
}

impl From<quick_xml::Error> for ParseError {
    fn from(err: quick_xml::Error) -> Self {
        Self::xml(err.to_string())
    }
}

impl From<quick_xml::events::attributes::AttrError> for ParseError {
    fn from(err: quick_xml::events::attributes::AttrError) -> Self {
        Self::xml(err.to_string())
    }
}
