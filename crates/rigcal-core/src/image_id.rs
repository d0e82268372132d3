//! Image identifiers.
//!
//! An [`ImageId`] is the path of an image relative to the color directory.
//! Two layout conventions are supported:
//! - directory per camera (default): `.../<camera id>/<frame index>.<ext>`
//! - directory per frame: `<frame index>/.../<camera id>.<ext>`

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// How image paths encode camera id and frame index.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RigLayout {
    #[default]
    DirPerCamera,
    DirPerFrame,
}

impl RigLayout {
    /// Human-readable path template, used in error messages.
    pub fn format(&self) -> &'static str {
        match self {
            RigLayout::DirPerCamera => ".../<camera id>/<frame index>.<extension>",
            RigLayout::DirPerFrame => "<frame index>/ ... /<camera id>.<extension>",
        }
    }
}

/// Relative image path used as a key in feature maps and match documents.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageId(pub String);

impl ImageId {
    pub fn new(path: impl Into<String>) -> Self {
        ImageId(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Camera id encoded in the path, per the layout convention.
    pub fn camera_id(&self, layout: RigLayout) -> Option<String> {
        let path = Path::new(&self.0);
        match layout {
            RigLayout::DirPerCamera => Some(path.parent()?.file_name()?.to_str()?.to_string()),
            RigLayout::DirPerFrame => Some(path.file_stem()?.to_str()?.to_string()),
        }
    }

    /// Frame index encoded in the path, per the layout convention.
    pub fn frame_index(&self, layout: RigLayout) -> Option<i64> {
        let path = Path::new(&self.0);
        let part = match layout {
            RigLayout::DirPerCamera => path.file_stem()?.to_str()?,
            RigLayout::DirPerFrame => path.iter().next()?.to_str()?,
        };
        part.parse().ok()
    }

    /// Build an id that adheres to the layout's path format. `frame` is kept
    /// verbatim so zero-padding survives; synthetic data passes a bare index
    /// and no extension.
    pub fn from_parts(layout: RigLayout, camera_id: &str, frame: &str) -> Self {
        match layout {
            RigLayout::DirPerCamera => ImageId(format!("{camera_id}/{frame}")),
            RigLayout::DirPerFrame => ImageId(format!("{frame}/{camera_id}")),
        }
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ImageId {
    fn from(s: &str) -> Self {
        ImageId(s.to_string())
    }
}
