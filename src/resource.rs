//! Named resource lookup
//!
//! Credential stores and configuration files are addressed by name. A name is
//! first looked up as a resource: either an in-memory resource registered on
//! the loader or a file below one of the resource roots (the equivalent of a
//! class path). Only when the caller allows it is the name then tried as a
//! plain filesystem path.

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::{error, warn};

/// Resolves resource names to byte content
#[derive(Debug, Clone, Default)]
pub struct ResourceLoader {
    roots: Vec<PathBuf>,
    embedded: HashMap<String, Vec<u8>>,
}

impl ResourceLoader {
    /// Loader without roots; only embedded resources and (optionally) the filesystem are used
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a directory searched for resources, in insertion order
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.roots.push(root.into());
        self
    }

    /// Register an in-memory resource
    pub fn with_resource(mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.embedded.insert(name.into(), bytes.into());
        self
    }

    /// Open `name`, trying resources first and then, if `allow_filesystem` is
    /// set, the exact filesystem path. Returns `None` when neither exists;
    /// the miss is logged unless `silent`.
    pub fn open(&self, name: &str, allow_filesystem: bool, silent: bool) -> Option<Vec<u8>> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return None;
        }

        // resource names are always relative to a root
        let resource_name = trimmed.trim_start_matches('/');

        if let Some(bytes) = self.embedded.get(resource_name) {
            return Some(bytes.clone());
        }

        for root in &self.roots {
            let candidate = root.join(resource_name);
            if candidate.is_file() {
                match fs::read(&candidate) {
                    Ok(bytes) => return Some(bytes),
                    Err(e) => warn!(path = %candidate.display(), "can't read resource: {}", e),
                }
            }
        }

        if allow_filesystem {
            match fs::read(Path::new(trimmed)) {
                Ok(bytes) => return Some(bytes),
                Err(_) if silent => {}
                Err(_) => error!("can't find resource or file for name '{}'", trimmed),
            }
        } else if !silent {
            error!("can't find resource '{}'", trimmed);
        }

        None
    }

    /// Read at most `count` leading bytes of `name`; empty when it can't be opened
    pub fn header(&self, name: &str, allow_filesystem: bool, count: usize) -> Vec<u8> {
        let Some(bytes) = self.open(name, allow_filesystem, true) else {
            return Vec::new();
        };

        let mut header = Vec::with_capacity(count);
        let read = bytes.as_slice().take(count as u64).read_to_end(&mut header);
        match read {
            Ok(n) if n < count => {
                warn!("read {} bytes only from {} (expected {} bytes)", n, name, count);
            }
            Ok(_) => {}
            Err(e) => error!("can't read header of {}: {}", name, e),
        }
        header
    }
}
