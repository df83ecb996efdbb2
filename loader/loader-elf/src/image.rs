//! # Executable Images
//!
//! An opened file together with its parsed header and loadable segments. The
//! file stays open for the lifetime of the image because pages are mapped
//! from it on demand.

use crate::header::{BinaryHeader, ElfClass};
use crate::segment::SegmentTable;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("failed to open {}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("the file is shorter than an ELF header")]
    TruncatedHeader,
    #[error("the program header table extends past the end of the file")]
    TruncatedSegmentTable,
    #[error("the file does not start with the ELF magic bytes")]
    BadMagic,
    #[error("unsupported ELF class {0}")]
    UnsupportedClass(u8),
    #[error("unsupported ELF data encoding {0} (only little-endian images are loaded)")]
    UnsupportedEncoding(u8),
    #[error("program header entries are {declared} bytes, expected at least {expected}")]
    SegmentEntrySize { declared: u16, expected: usize },
    #[error("I/O error while reading the image")]
    Io(#[from] io::Error),
}

/// An opened executable: its header, its loadable segments and the file
/// handle pages are mapped from.
#[derive(Debug)]
pub struct Image {
    path: PathBuf,
    header: BinaryHeader,
    segments: SegmentTable,
    file: File,
}

impl Image {
    /// Open `path` read-only and read its header and segment table.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ImageError> {
        let path = path.as_ref();
        let mut file = File::open(path).map_err(|source| ImageError::Open {
            path: path.to_path_buf(),
            source,
        })?;

        let header = BinaryHeader::read(&mut file)?;
        let segments = SegmentTable::read(&mut file, &header)?;

        log::debug!(
            "{}: ELF{} machine={} entry={} phoff={} phnum={} ({} loadable)",
            path.display(),
            header.class.bits(),
            header.machine,
            header.entry,
            header.phoff,
            header.phnum,
            segments.len()
        );
        for (i, seg) in segments.iter().enumerate() {
            log::trace!(
                "  [{i}] vaddr={} offset={:#x} filesz={:#x} memsz={:#x} {}",
                seg.vaddr,
                seg.offset,
                seg.filesz,
                seg.memsz,
                seg.flags.as_rwx().iter().collect::<String>()
            );
        }

        Ok(Self {
            path: path.to_path_buf(),
            header,
            segments,
            file,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn header(&self) -> &BinaryHeader {
        &self.header
    }

    #[must_use]
    pub const fn class(&self) -> ElfClass {
        self.header.class
    }

    #[must_use]
    pub const fn segments(&self) -> &SegmentTable {
        &self.segments
    }

    /// The file the image was read from; pages are mapped from it.
    #[must_use]
    pub const fn file(&self) -> &File {
        &self.file
    }
}
