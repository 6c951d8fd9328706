//! Binary statement file codec.
//!
//! Layout: the magic bytes `B M S F` and one format version byte, followed
//! by a GZIP-compressed body of marker-prefixed records. Strings are
//! length-prefixed (`u32`, big-endian) UTF-8. Version 1 files used a
//! different string encoding and are rejected.

use crate::memory::namespaces::NamespaceStore;
use crate::memory::store::{MemStoreReader, MemoryStore};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use quadmem_common::error::StorageError;
use quadmem_model::{
    BlankNode, GraphName, GraphNameRef, Literal, NamedNode, Quad, Subject, Term, TermRef,
};
use std::io::{self, Read, Write};
use tracing::debug;

const MAGIC_NUMBER: [u8; 4] = *b"BMSF";
const FORMAT_VERSION: u8 = 2;

const NAMESPACE_MARKER: u8 = 1;
const EXPL_TRIPLE_MARKER: u8 = 2;
const EXPL_QUAD_MARKER: u8 = 3;
const INF_TRIPLE_MARKER: u8 = 4;
const INF_QUAD_MARKER: u8 = 5;
const URI_MARKER: u8 = 6;
const BNODE_MARKER: u8 = 7;
const PLAIN_LITERAL_MARKER: u8 = 8;
const LANG_LITERAL_MARKER: u8 = 9;
const DATATYPE_LITERAL_MARKER: u8 = 10;
const EOF_MARKER: u8 = 127;

/// An error raised while decoding a binary statement file.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum FormatError {
    #[error("not a binary statement file: bad magic number")]
    InvalidMagic,
    #[error("unsupported binary statement file version {0}")]
    UnsupportedVersion(u8),
    #[error("invalid record marker {0}")]
    InvalidMarker(u8),
    #[error("unexpected end of binary statement file")]
    UnexpectedEof,
    #[error("malformed UTF-8 in binary statement file")]
    InvalidUtf8,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<FormatError> for StorageError {
    fn from(error: FormatError) -> Self {
        match error {
            FormatError::Io(e) => Self::Io(e),
            e => Self::Io(io::Error::new(io::ErrorKind::InvalidData, e)),
        }
    }
}

/// Writes the statements visible to `reader`, plus the namespace table, as a
/// binary statement file.
pub fn write_snapshot<W: Write>(
    reader: &MemStoreReader,
    namespaces: &NamespaceStore,
    mut write: W,
) -> Result<(), FormatError> {
    write.write_all(&MAGIC_NUMBER)?;
    write.write_all(&[FORMAT_VERSION])?;

    let mut body = GzEncoder::new(write, Compression::default());
    for namespace in namespaces.iter() {
        body.write_all(&[NAMESPACE_MARKER])?;
        write_string(&mut body, namespace.prefix())?;
        write_string(&mut body, namespace.iri())?;
    }
    let mut written = 0usize;
    for statement in reader.statements(None, None, None, None, false) {
        let context = statement.context();
        let marker = match (statement.is_explicit(), context) {
            (true, GraphName::DefaultGraph) => EXPL_TRIPLE_MARKER,
            (true, _) => EXPL_QUAD_MARKER,
            (false, GraphName::DefaultGraph) => INF_TRIPLE_MARKER,
            (false, _) => INF_QUAD_MARKER,
        };
        body.write_all(&[marker])?;
        write_term(&mut body, statement.subject().as_ref().into())?;
        write_term(&mut body, statement.predicate().as_ref().into())?;
        write_term(&mut body, statement.object().as_ref())?;
        match context.as_ref() {
            GraphNameRef::DefaultGraph => {}
            GraphNameRef::NamedNode(n) => write_term(&mut body, n.into())?,
            GraphNameRef::BlankNode(b) => write_term(&mut body, b.into())?,
        }
        written += 1;
    }
    body.write_all(&[EOF_MARKER])?;
    body.finish()?;
    debug!(statements = written, "wrote binary statement file");
    Ok(())
}

/// Reads a binary statement file into `store` through a bulk load session.
/// The load is atomic: nothing becomes visible unless the whole file decodes
/// cleanly.
pub fn read_snapshot<R: Read>(read: R, store: &MemoryStore) -> Result<(), FormatError> {
    let mut read = read;
    let mut magic = [0u8; 4];
    read_exact(&mut read, &mut magic)?;
    if magic != MAGIC_NUMBER {
        return Err(FormatError::InvalidMagic);
    }
    let version = read_byte(&mut read)?;
    if version != FORMAT_VERSION {
        return Err(FormatError::UnsupportedVersion(version));
    }

    let mut body = GzDecoder::new(read);
    let loader = store.bulk_loader();
    let mut session = loader
        .session()
        .map_err(|e| FormatError::Io(e.into()))?;
    let mut loaded = 0usize;
    loop {
        let marker = read_byte(&mut body)?;
        match marker {
            NAMESPACE_MARKER => {
                let prefix = read_string(&mut body)?;
                let iri = read_string(&mut body)?;
                session.set_namespace(&prefix, &iri);
            }
            EXPL_TRIPLE_MARKER => read_statement(&mut body, &mut session, false, true)?,
            EXPL_QUAD_MARKER => read_statement(&mut body, &mut session, true, true)?,
            INF_TRIPLE_MARKER => read_statement(&mut body, &mut session, false, false)?,
            INF_QUAD_MARKER => read_statement(&mut body, &mut session, true, false)?,
            EOF_MARKER => break,
            marker => return Err(FormatError::InvalidMarker(marker)),
        }
        loaded += 1;
    }
    // Drain through the gzip trailer so the checksum gets validated; a file
    // truncated after the records must fail, not load a shorter store.
    let mut trailing = Vec::new();
    body.read_to_end(&mut trailing).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            FormatError::UnexpectedEof
        } else {
            FormatError::Io(e)
        }
    })?;
    if let Some(&extra) = trailing.first() {
        return Err(FormatError::InvalidMarker(extra));
    }
    session.finish();
    debug!(records = loaded, "read binary statement file");
    Ok(())
}

fn read_statement<R: Read>(
    read: &mut R,
    session: &mut crate::memory::loader::BulkLoadSession<'_>,
    has_context: bool,
    explicit: bool,
) -> Result<(), FormatError> {
    let subject = read_resource(read)?;
    let predicate = match read_value(read)? {
        (_, Term::NamedNode(n)) => n,
        (marker, _) => return Err(FormatError::InvalidMarker(marker)),
    };
    let (_, object) = read_value(read)?;
    let context = if has_context {
        match read_resource(read)? {
            Subject::NamedNode(n) => GraphName::NamedNode(n),
            Subject::BlankNode(b) => GraphName::BlankNode(b),
        }
    } else {
        GraphName::DefaultGraph
    };
    session.insert(
        Quad::new(subject, predicate, object, context).as_ref(),
        explicit,
    );
    Ok(())
}

fn write_term<W: Write>(write: &mut W, term: TermRef<'_>) -> Result<(), FormatError> {
    match term {
        TermRef::NamedNode(n) => {
            write.write_all(&[URI_MARKER])?;
            write_string(write, n.as_str())
        }
        TermRef::BlankNode(b) => {
            write.write_all(&[BNODE_MARKER])?;
            write_string(write, b.as_str())
        }
        TermRef::Literal(lit) => {
            if let Some(language) = lit.language() {
                write.write_all(&[LANG_LITERAL_MARKER])?;
                write_string(write, lit.value())?;
                write_string(write, language)
            } else if lit.datatype() == quadmem_model::vocab::xsd::STRING {
                write.write_all(&[PLAIN_LITERAL_MARKER])?;
                write_string(write, lit.value())
            } else {
                write.write_all(&[DATATYPE_LITERAL_MARKER])?;
                write_string(write, lit.value())?;
                write_term(write, TermRef::NamedNode(lit.datatype()))
            }
        }
    }
}

fn read_value<R: Read>(read: &mut R) -> Result<(u8, Term), FormatError> {
    let marker = read_byte(read)?;
    let term = match marker {
        URI_MARKER => NamedNode::new_unchecked(read_string(read)?).into(),
        BNODE_MARKER => BlankNode::new_unchecked(read_string(read)?).into(),
        PLAIN_LITERAL_MARKER => Literal::new_simple_literal(read_string(read)?).into(),
        LANG_LITERAL_MARKER => {
            let label = read_string(read)?;
            let language = read_string(read)?;
            Literal::new_language_tagged_literal_unchecked(label, language).into()
        }
        DATATYPE_LITERAL_MARKER => {
            let label = read_string(read)?;
            // A datatype is always a URI; no deeper nesting exists, so a
            // crafted chain of literal markers cannot recurse here.
            match read_byte(read)? {
                URI_MARKER => {
                    Literal::new_typed_literal(label, NamedNode::new_unchecked(read_string(read)?))
                        .into()
                }
                marker => return Err(FormatError::InvalidMarker(marker)),
            }
        }
        marker => return Err(FormatError::InvalidMarker(marker)),
    };
    Ok((marker, term))
}

fn read_resource<R: Read>(read: &mut R) -> Result<Subject, FormatError> {
    match read_value(read)? {
        (_, Term::NamedNode(n)) => Ok(n.into()),
        (_, Term::BlankNode(b)) => Ok(b.into()),
        (marker, Term::Literal(_)) => Err(FormatError::InvalidMarker(marker)),
    }
}

fn write_string<W: Write>(write: &mut W, value: &str) -> Result<(), FormatError> {
    let len = u32::try_from(value.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "string longer than 4 GiB"))?;
    write.write_all(&len.to_be_bytes())?;
    write.write_all(value.as_bytes())?;
    Ok(())
}

fn read_string<R: Read>(read: &mut R) -> Result<String, FormatError> {
    let mut len = [0u8; 4];
    read_exact(read, &mut len)?;
    let mut buf = vec![0u8; u32::from_be_bytes(len) as usize];
    read_exact(read, &mut buf)?;
    String::from_utf8(buf).map_err(|_| FormatError::InvalidUtf8)
}

fn read_byte<R: Read>(read: &mut R) -> Result<u8, FormatError> {
    let mut buf = [0u8; 1];
    read_exact(read, &mut buf)?;
    Ok(buf[0])
}

fn read_exact<R: Read>(read: &mut R, buf: &mut [u8]) -> Result<(), FormatError> {
    read.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            FormatError::UnexpectedEof
        } else {
            FormatError::Io(e)
        }
    })
}
