//! Chain description loading
//!
//! A chain description is UTF-8 text, one chain per line, in the field
//! grammar of [`parser`]. Lines starting with `#` and blank lines are
//! ignored. Parsed chains are handed straight to a picker; kwargs
//! promoted by directive-only lines persist across every source loaded
//! through the same [`Loader`].

mod duration;
mod parser;

pub use duration::parse_duration;
pub use parser::{parse_chain, split_fields};

use crate::error::{Result, SockchainError};
use crate::picker::ChainPicker;
use crate::proxy::Kwargs;
use std::io::BufRead;
use std::path::Path;
use tracing::debug;

/// Per-hop handshake deadline option
pub const KWARG_CONN_TIMEOUT: &str = "ConnTimeout";
/// Read deadline applied to the final connection
pub const KWARG_READ_TIMEOUT: &str = "ReadTimeout";
/// Write deadline applied to the final connection
pub const KWARG_WRITE_TIMEOUT: &str = "WriteTimeout";
/// Whole-chain dial deadline, read from the first hop
pub const KWARG_CHAIN_CONN_TIMEOUT: &str = "ChainConnTimeout";

/// Loads chain descriptions into a picker
///
/// Holds the process-wide default kwargs seeded by directive-only
/// lines. Sources must be loaded one after another through the same
/// loader, before serving starts.
#[derive(Debug, Default)]
pub struct Loader {
    defaults: Kwargs,
}

impl Loader {
    /// Create a loader with empty default kwargs.
    pub fn new() -> Self {
        Loader::default()
    }

    /// Load chains from a reader, adding each to `picker`.
    ///
    /// `origin` names the source in error messages, e.g. a file path
    /// or `<stdin>`.
    pub fn load<R: BufRead>(
        &mut self,
        origin: &str,
        reader: R,
        picker: &dyn ChainPicker,
    ) -> Result<()> {
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.starts_with('#') {
                continue;
            }

            let located = |e: SockchainError| match e {
                SockchainError::Config(msg) => {
                    SockchainError::Config(format!("{}:{}: {}", origin, index + 1, msg))
                }
                other => other,
            };

            let fields = split_fields(&line).map_err(located)?;
            if fields.is_empty() {
                continue;
            }

            let chain = parse_chain(&fields, &mut self.defaults).map_err(located)?;
            if !chain.is_empty() {
                debug!("loaded chain: {}", chain);
                picker.add(chain);
            }
        }

        Ok(())
    }

    /// Load chains from a file.
    pub fn load_file<P: AsRef<Path>>(&mut self, path: P, picker: &dyn ChainPicker) -> Result<()> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|e| {
            SockchainError::Config(format!("{}: {}", path.display(), e))
        })?;
        self.load(
            &path.display().to_string(),
            std::io::BufReader::new(file),
            picker,
        )
    }

    /// The current process-wide default kwargs.
    pub fn defaults(&self) -> &Kwargs {
        &self.defaults
    }
}
