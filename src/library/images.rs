//! Image byte providers for the package builder.

use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;

/// Supplies image bytes by logical path
pub trait ImageProvider {
    /// Open an image for streaming into a package
    fn open(&self, logical_path: &str) -> io::Result<Box<dyn Read>>;
}

/// Reads images from a directory that mirrors the logical layout
/// (`<root>/drill_images/TE_078/TE_078_page_2.png`)
#[derive(Debug, Clone)]
pub struct DirImageProvider {
    root: PathBuf,
}

impl DirImageProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_of(&self, logical_path: &str) -> PathBuf {
        logical_path
            .split('/')
            .filter(|part| !part.is_empty() && *part != "." && *part != "..")
            .fold(self.root.clone(), |path, part| path.join(part))
    }
}

impl ImageProvider for DirImageProvider {
    fn open(&self, logical_path: &str) -> io::Result<Box<dyn Read>> {
        let file = File::open(self.path_of(logical_path))?;
        Ok(Box::new(io::BufReader::new(file)))
    }
}
