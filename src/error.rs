use std::{fmt, io, path::StripPrefixError};

use handlebars::{RenderError, TemplateError};
use regex::Error as RegexError;
use serde::{Deserialize, Serialize};
use serde_json::Error as JsonError;
use tempfile::PersistError;
use thiserror::Error;

#[cfg(feature = "service")]
use notify::{Error as NotifyError, ErrorKind as NotifyErrorKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
pub enum PagewrightError {
    #[error("Aggregation failed: {0}")]
    Aggregation(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Custom error: {0}")]
    Custom(String),
    #[error("File System error: {0}")]
    Io(String),
    #[error("Item Not Found: {0}")]
    NotFound(String),
    #[error("Could not determine references of '{document}': {message}")]
    Parse { document: String, message: String },
    #[error("You do not have permission to access this resource")]
    PermissionDenied,
    #[error("Failed to render '{document}': {message}")]
    Render { document: String, message: String },
    #[error("(De)Serialization error: {0}")]
    Serialization(String),
    #[error("Command `{command}` failed with status {status:?}: {stderr}")]
    Shell {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("Watch error: {0}")]
    Watch(String),
}

impl PagewrightError {
    /// Attach a document identity to an error raised while handling that document.
    pub fn render_failure(document: impl fmt::Display, err: impl fmt::Display) -> Self {
        PagewrightError::Render {
            document: document.to_string(),
            message: err.to_string(),
        }
    }

    pub fn parse_failure(document: impl fmt::Display, err: impl fmt::Display) -> Self {
        PagewrightError::Parse {
            document: document.to_string(),
            message: err.to_string(),
        }
    }
}

impl From<StripPrefixError> for PagewrightError {
    fn from(src: StripPrefixError) -> PagewrightError {
        PagewrightError::NotFound(format!("Strip prefix failed for path. Error: {src}"))
    }
}

impl From<toml::de::Error> for PagewrightError {
    fn from(src: toml::de::Error) -> PagewrightError {
        PagewrightError::Serialization(format!("Toml deserialization error: {src}"))
    }
}

impl From<serde_yaml::Error> for PagewrightError {
    fn from(src: serde_yaml::Error) -> PagewrightError {
        PagewrightError::Serialization(format!("Yaml deserialization error: {src}"))
    }
}

impl From<JsonError> for PagewrightError {
    fn from(src: JsonError) -> PagewrightError {
        PagewrightError::Serialization(format!("JSON (de)serialization error: {src}"))
    }
}

impl From<io::Error> for PagewrightError {
    fn from(x: io::Error) -> Self {
        match x.kind() {
            io::ErrorKind::NotFound => PagewrightError::NotFound(format!("{x}")),
            io::ErrorKind::PermissionDenied => PagewrightError::PermissionDenied,
            _ => PagewrightError::Io(format!("IOError: {}: {x}", x.kind())),
        }
    }
}

impl From<fmt::Error> for PagewrightError {
    fn from(x: fmt::Error) -> Self {
        PagewrightError::Custom(format!("{x}"))
    }
}

impl From<RegexError> for PagewrightError {
    fn from(x: RegexError) -> Self {
        PagewrightError::Serialization(format!("Regex parse failed: {x}"))
    }
}

impl From<globset::Error> for PagewrightError {
    fn from(x: globset::Error) -> Self {
        PagewrightError::Config(format!("Invalid glob pattern: {x}"))
    }
}

impl From<walkdir::Error> for PagewrightError {
    fn from(x: walkdir::Error) -> Self {
        match x.into_io_error() {
            Some(io_error) => io_error.into(),
            None => PagewrightError::Io("directory walk hit a filesystem loop".to_string()),
        }
    }
}

impl From<PersistError> for PagewrightError {
    fn from(x: PersistError) -> Self {
        PagewrightError::Io(format!(
            "Could not move temporary file into place at {:?}: {}",
            x.file.path(),
            x.error
        ))
    }
}

impl From<TemplateError> for PagewrightError {
    fn from(x: TemplateError) -> Self {
        PagewrightError::Custom(format!("Template error: {x}"))
    }
}

impl From<RenderError> for PagewrightError {
    fn from(x: RenderError) -> Self {
        PagewrightError::Custom(format!("Template render error: {x}"))
    }
}

impl From<tokio::task::JoinError> for PagewrightError {
    fn from(x: tokio::task::JoinError) -> Self {
        PagewrightError::Custom(format!("Background task failed: {x}"))
    }
}

#[cfg(feature = "service")]
impl From<NotifyError> for PagewrightError {
    fn from(notify_error: NotifyError) -> Self {
        match notify_error.kind {
            NotifyErrorKind::Generic(msg) => PagewrightError::Watch(format!(
                "notify: {}, paths: {:?}",
                msg, notify_error.paths
            )),
            NotifyErrorKind::Io(io_error) => PagewrightError::Watch(format!(
                "notify: io error {}, paths: {:?}",
                io_error.kind(),
                notify_error.paths
            )),
            NotifyErrorKind::PathNotFound => PagewrightError::NotFound(format!(
                "notify: path(s) not found: {:?}",
                notify_error.paths
            )),
            NotifyErrorKind::WatchNotFound => PagewrightError::NotFound(format!(
                "notify: watch not found, paths: {:?}",
                notify_error.paths
            )),
            NotifyErrorKind::InvalidConfig(_) => {
                PagewrightError::Watch("notify invalid config".to_string())
            }
            NotifyErrorKind::MaxFilesWatch => {
                PagewrightError::Watch("notify max file watch limit reached".to_string())
            }
        }
    }
}
