//! What the allocator tells you at shutdown: how full each page is, and
//! what was never freed.

use std::{
    fmt,
    fs::File,
    io::{self, Read, Write},
    path::Path,
};

use serde::{Deserialize, Serialize};

use crate::{
    alloc::{meta::Chunk, page::Page},
    serialize::serde_usize,
    stack::symbol::{ResolveError, Symbol, SymbolResolver},
};

const RULE: &str = "------------------------------------------------";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageReport {
    /// 1-based, in creation order
    pub index: usize,
    pub free_blocks: usize,
}

/// Utilisation snapshot. Says nothing about leaks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryReport {
    pub pages: Vec<PageReport>,
}

impl MemoryReport {
    /// `pages` must come oldest first
    pub fn from_pages<'a, I>(pages: I) -> Self
    where
        I: IntoIterator<Item = &'a Page>,
    {
        Self {
            pages: pages
                .into_iter()
                .enumerate()
                .map(|(i, page)| PageReport {
                    index: i + 1,
                    free_blocks: page.free_block_count(),
                })
                .collect(),
        }
    }
}

impl fmt::Display for MemoryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "----------------Memory Report----------------")?;
        for page in self.pages.iter() {
            writeln!(f, "Page {}", page.index)?;
            writeln!(f, "\t Free Count:{}", page.free_blocks)?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameResolution {
    Resolved(Symbol),
    Failed(ResolveError),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeakFrame {
    /// Position in the captured stack, oldest caller is `0`
    pub index: usize,
    #[serde(with = "serde_usize")]
    pub address: *const (),
    pub resolution: FrameResolution,
}

impl fmt::Display for LeakFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.resolution {
            FrameResolution::Resolved(symbol) => {
                write!(
                    f,
                    "\t[{}] {}({:p}) +{:#x}",
                    self.index, symbol.name, self.address, symbol.displacement
                )?;
                match symbol.line {
                    Some(line) => write!(f, " Line {line}")?,
                    None => write!(f, " Line ?")?,
                }
                match &symbol.file {
                    Some(file) => write!(f, " in {file}"),
                    None => Ok(()),
                }
            }
            FrameResolution::Failed(e) => {
                write!(f, "\t[{}] ({:p}) {e}", self.index, self.address)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeakEntry {
    #[serde(with = "serde_usize")]
    pub address: *const u8,
    pub size: usize,
    pub frames: Vec<LeakFrame>,
}

/// Every allocation still registered at dump time, ordered by address.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeakDump {
    pub leaks: Vec<LeakEntry>,
}

#[non_exhaustive]
#[derive(Debug)]
pub enum LeakDumpFileError {
    IoError(io::Error),
    SerdeJsonError(serde_json::error::Error),
}

impl fmt::Display for LeakDumpFileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeakDumpFileError::IoError(e) => write!(f, "leak dump I/O failed: {e}"),
            LeakDumpFileError::SerdeJsonError(e) => write!(f, "leak dump is not valid: {e}"),
        }
    }
}

impl std::error::Error for LeakDumpFileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LeakDumpFileError::IoError(e) => Some(e),
            LeakDumpFileError::SerdeJsonError(e) => Some(e),
        }
    }
}

impl LeakDump {
    /// Resolve every frame of every chunk. A frame that fails to resolve is
    /// recorded as such; it never stops the dump.
    pub fn collect<'a, I, R>(chunks: I, resolver: R) -> Self
    where
        I: IntoIterator<Item = &'a Chunk>,
        R: SymbolResolver,
    {
        let leaks = chunks
            .into_iter()
            .map(|chunk| LeakEntry {
                address: chunk.address as *const u8,
                size: chunk.size,
                frames: chunk
                    .frames
                    .as_slice()
                    .iter()
                    .enumerate()
                    .map(|(index, &address)| LeakFrame {
                        index,
                        address: address as *const (),
                        resolution: match resolver.resolve(address) {
                            Ok(symbol) => FrameResolution::Resolved(symbol),
                            Err(e) => FrameResolution::Failed(e),
                        },
                    })
                    .collect(),
            })
            .collect();
        Self { leaks }
    }

    pub fn is_empty(&self) -> bool {
        self.leaks.is_empty()
    }

    /// Number of leaked allocations
    pub fn len(&self) -> usize {
        self.leaks.len()
    }

    /// Total leaked bytes, as requested (headers and slack not counted)
    pub fn leaked_bytes(&self) -> usize {
        self.leaks.iter().map(|leak| leak.size).sum()
    }

    pub fn write_to_file<P>(&self, path: P) -> Result<(), LeakDumpFileError>
    where
        P: AsRef<Path>,
    {
        let mut file = File::create(path).map_err(LeakDumpFileError::IoError)?;
        let buf = serde_json::to_vec_pretty(self).map_err(LeakDumpFileError::SerdeJsonError)?;
        file.write_all(&buf).map_err(LeakDumpFileError::IoError)
    }

    pub fn from_file<P>(path: P) -> Result<Self, LeakDumpFileError>
    where
        P: AsRef<Path>,
    {
        let mut file = File::open(path).map_err(LeakDumpFileError::IoError)?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)
            .map_err(LeakDumpFileError::IoError)?;
        serde_json::from_str(&buf).map_err(LeakDumpFileError::SerdeJsonError)
    }
}

impl fmt::Display for LeakDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "----------------Memory Leak Dump----------------")?;
        if self.leaks.is_empty() {
            writeln!(f, "no leak detected.")?;
        }
        for leak in self.leaks.iter() {
            writeln!(f, "Leak at address : {:p} , size : {}", leak.address, leak.size)?;
            for frame in leak.frames.iter() {
                writeln!(f, "{frame}")?;
            }
        }
        writeln!(f, "{RULE}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::{symbol::ResolveErrorKind, CallFrames};

    fn not_mapped() -> ResolveError {
        ResolveError::new(ResolveErrorKind::NotMapped, "lookup", "not in any object").with_code(6)
    }

    /// Knows exactly one function, `known`, at 0x4000..0x4100
    struct OneSymbol;

    impl SymbolResolver for OneSymbol {
        fn resolve(&self, address: usize) -> Result<Symbol, ResolveError> {
            if (0x4000..0x4100).contains(&address) {
                Ok(Symbol {
                    name: "known".to_owned(),
                    displacement: address - 0x4000,
                    file: Some("src/known.rs".to_owned()),
                    line: Some(12),
                })
            } else {
                Err(not_mapped())
            }
        }
    }

    fn chunks() -> Vec<Chunk> {
        vec![
            Chunk::new(0x9000, 24, CallFrames::from_addresses(&[0x4010, 0xdead])),
            Chunk::new(0x8000, 8, CallFrames::new()),
        ]
    }

    #[test]
    fn empty_dump_says_so() {
        let dump = LeakDump::collect(Vec::new(), OneSymbol);
        assert!(dump.is_empty());
        let text = dump.to_string();
        assert!(text.contains("no leak detected."));
        assert!(text.ends_with(&format!("{RULE}\n")));
    }

    #[test]
    fn failed_frames_do_not_stop_the_dump() {
        let chunks = chunks();
        let dump = LeakDump::collect(chunks.iter(), OneSymbol);
        assert_eq!(dump.len(), 2);
        assert_eq!(dump.leaked_bytes(), 32);

        let frames = &dump.leaks[0].frames;
        assert_eq!(frames.len(), 2);
        assert!(matches!(
            &frames[0].resolution,
            FrameResolution::Resolved(Symbol { displacement: 0x10, .. })
        ));
        assert_eq!(
            frames[1].resolution,
            FrameResolution::Failed(not_mapped())
        );
        assert!(dump.leaks[1].frames.is_empty());

        let text = dump.to_string();
        assert!(text.contains(", size : 24"));
        assert!(text.contains("[0] known(0x4010) +0x10 Line 12 in src/known.rs"));
        assert!(text.contains(
            "[1] (0xdead) lookup() failed: not in any object. Error code: 6"
        ));
        assert!(!text.contains("no leak detected."));
    }

    #[test]
    fn dump_survives_a_trip_through_json() {
        let chunks = chunks();
        let dump = LeakDump::collect(chunks.iter(), OneSymbol);
        let path = std::env::temp_dir().join(format!("pagetrace-dump-{}.json", std::process::id()));
        dump.write_to_file(&path).unwrap();
        let back = LeakDump::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(back, dump);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        assert!(matches!(
            LeakDump::from_file("/definitely/not/here.json"),
            Err(LeakDumpFileError::IoError(_))
        ));
    }

    #[test]
    fn memory_report_lists_pages() {
        let report = MemoryReport {
            pages: vec![
                PageReport {
                    index: 1,
                    free_blocks: 0,
                },
                PageReport {
                    index: 2,
                    free_blocks: 128,
                },
            ],
        };
        let text = report.to_string();
        assert!(text.contains("Page 1\n\t Free Count:0\n"));
        assert!(text.contains("Page 2\n\t Free Count:128\n"));
    }
}
