//! Minimal binary little-endian PLY reader and writer.
//!
//! Only scalar properties are supported. Elements are read as fixed-width
//! rows and exposed column by column, so callers never materialize one
//! object per row.

use std::io::Write;

use foldhash::HashMap;
use foldhash::HashMapExt;

use crate::common::next_line;
use crate::error::FoamError;

const FORMAT_LINE: &[u8] = b"format binary_little_endian 1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    UChar,
    UInt,
    Int,
    Float,
}

impl ScalarKind {
    fn parse(name: &[u8]) -> Option<Self> {
        match name {
            b"uchar" | b"uint8" => Some(ScalarKind::UChar),
            b"uint" | b"uint32" => Some(ScalarKind::UInt),
            b"int" | b"int32" => Some(ScalarKind::Int),
            b"float" | b"float32" => Some(ScalarKind::Float),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            ScalarKind::UChar => "uchar",
            ScalarKind::UInt => "uint",
            ScalarKind::Int => "int",
            ScalarKind::Float => "float",
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        match self {
            ScalarKind::UChar => 1,
            ScalarKind::UInt | ScalarKind::Int | ScalarKind::Float => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PropertyDef {
    pub name: String,
    pub kind: ScalarKind,
}

impl PropertyDef {
    pub fn new(name: impl Into<String>, kind: ScalarKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ElementDef {
    pub name: String,
    pub count: usize,
    pub properties: Vec<PropertyDef>,
}

impl ElementDef {
    pub fn new(name: impl Into<String>, count: usize) -> Self {
        Self {
            name: name.into(),
            count,
            properties: Vec::new(),
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, kind: ScalarKind) -> Self {
        self.properties.push(PropertyDef::new(name, kind));
        self
    }

    pub fn row_size(&self) -> usize {
        self.properties.iter().map(|p| p.kind.size()).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlyHeader {
    pub comments: Vec<String>,
    pub elements: Vec<ElementDef>,
}

impl PlyHeader {
    pub fn element(&self, name: &str) -> Option<&ElementDef> {
        self.elements.iter().find(|e| e.name == name)
    }

    /// Returns the whitespace-separated values of the first `comment <key> ...` line.
    pub fn comment_values(&self, key: &str) -> Option<Vec<&str>> {
        self.comments.iter().find_map(|c| {
            let mut parts = c.split_whitespace();
            (parts.next() == Some(key)).then(|| parts.collect())
        })
    }

    pub fn write(&self, output: &mut Vec<u8>) -> Result<(), FoamError> {
        output.extend_from_slice(b"ply\n");
        output.extend_from_slice(FORMAT_LINE);
        output.push(b'\n');
        for comment in &self.comments {
            writeln!(output, "comment {}", comment)?;
        }
        for element in &self.elements {
            writeln!(output, "element {} {}", element.name, element.count)?;
            for property in &element.properties {
                writeln!(output, "property {} {}", property.kind.name(), property.name)?;
            }
        }
        output.extend_from_slice(b"end_header\n");
        Ok(())
    }
}

fn utf8(bytes: &[u8]) -> Result<&str, FoamError> {
    std::str::from_utf8(bytes).map_err(|e| FoamError::format(format!("UTF-8 error: {}", e)))
}

/// Parses the header and returns it with the byte offset of the body.
pub fn parse_header(raw_data: &[u8]) -> Result<(PlyHeader, usize), FoamError> {
    let mut offset = 0;

    let magic = next_line(raw_data, &mut offset)
        .ok_or_else(|| FoamError::format("No 'ply' line"))?;
    if magic != b"ply" {
        return Err(FoamError::format("Not a .ply file (missing 'ply' header)"));
    }

    let format = next_line(raw_data, &mut offset)
        .ok_or_else(|| FoamError::format("Missing format line"))?;
    if format != FORMAT_LINE {
        return Err(FoamError::format(
            "Unsupported .ply format (only binary_little_endian 1.0 is supported)",
        ));
    }

    let mut header = PlyHeader::default();
    loop {
        let line = next_line(raw_data, &mut offset)
            .ok_or_else(|| FoamError::format("No 'end_header' found before EOF"))?;

        if line.starts_with(b"end_header") {
            break;
        } else if let Some(rest) = line.strip_prefix(b"comment") {
            header.comments.push(utf8(rest)?.trim().to_string());
        } else if line.starts_with(b"obj_info") {
            continue;
        } else if let Some(rest) = line.strip_prefix(b"element ") {
            let rest = utf8(rest)?;
            let mut parts = rest.split_whitespace();
            let (name, count) = match (parts.next(), parts.next()) {
                (Some(name), Some(count)) => (name, count),
                _ => {
                    return Err(FoamError::format(format!(
                        "Malformed element line: {}",
                        rest
                    )))
                }
            };
            let count = count.parse().map_err(|e| {
                FoamError::format(format!("Bad count for element '{}': {}", name, e))
            })?;
            header.elements.push(ElementDef::new(name, count));
        } else if let Some(rest) = line.strip_prefix(b"property ") {
            let element = header.elements.last_mut().ok_or_else(|| {
                FoamError::format("Property declared before any element")
            })?;
            if rest.starts_with(b"list ") {
                return Err(FoamError::format(format!(
                    "List properties are not supported (element '{}')",
                    element.name
                )));
            }
            let mut parts = rest.splitn(2, |&b| b == b' ');
            let kind_name = parts.next().unwrap_or_default();
            let kind = ScalarKind::parse(kind_name).ok_or_else(|| {
                FoamError::format(format!(
                    "Unsupported property type: {}",
                    String::from_utf8_lossy(kind_name)
                ))
            })?;
            let name = utf8(parts.next().unwrap_or_default())?.trim();
            if name.is_empty() {
                return Err(FoamError::format("Property without a name"));
            }
            element.properties.push(PropertyDef::new(name, kind));
        } else {
            return Err(FoamError::format(format!(
                "Unsupported header line: {}",
                String::from_utf8_lossy(line)
            )));
        }
    }

    Ok((header, offset))
}

/// A parsed element: its definition and the raw bytes of its rows.
#[derive(Debug, Clone, Copy)]
pub struct ElementView<'a> {
    pub def: &'a ElementDef,
    data: &'a [u8],
    row_size: usize,
}

impl<'a> ElementView<'a> {
    pub fn len(&self) -> usize {
        self.def.count
    }

    pub fn is_empty(&self) -> bool {
        self.def.count == 0
    }

    fn locate(&self, name: &str, kind: ScalarKind) -> Result<usize, FoamError> {
        let mut offset = 0;
        for property in &self.def.properties {
            if property.name == name {
                if property.kind != kind {
                    return Err(FoamError::format(format!(
                        "Property '{}' of '{}' is {}, expected {}",
                        name,
                        self.def.name,
                        property.kind.name(),
                        kind.name()
                    )));
                }
                return Ok(offset);
            }
            offset += property.kind.size();
        }
        Err(FoamError::format(format!(
            "Missing required field: {} (element '{}')",
            name, self.def.name
        )))
    }

    fn column_4bytes(&self, name: &str, kind: ScalarKind) -> Result<Vec<[u8; 4]>, FoamError> {
        let at = self.locate(name, kind)?;
        let mut out = Vec::with_capacity(self.def.count);
        for row in self.data.chunks_exact(self.row_size) {
            let mut word = [0u8; 4];
            word.copy_from_slice(&row[at..at + 4]);
            out.push(word);
        }
        Ok(out)
    }

    pub fn column_f32(&self, name: &str) -> Result<Vec<f32>, FoamError> {
        Ok(self
            .column_4bytes(name, ScalarKind::Float)?
            .into_iter()
            .map(f32::from_le_bytes)
            .collect())
    }

    pub fn column_u32(&self, name: &str) -> Result<Vec<u32>, FoamError> {
        Ok(self
            .column_4bytes(name, ScalarKind::UInt)?
            .into_iter()
            .map(u32::from_le_bytes)
            .collect())
    }

    pub fn column_u8(&self, name: &str) -> Result<Vec<u8>, FoamError> {
        let at = self.locate(name, ScalarKind::UChar)?;
        Ok(self.data.chunks_exact(self.row_size).map(|row| row[at]).collect())
    }

    /// Reads several float columns into one interleaved buffer of `names.len()` values per row.
    pub fn interleaved_f32(&self, names: &[&str]) -> Result<Vec<f32>, FoamError> {
        let offsets = names
            .iter()
            .map(|n| self.locate(n, ScalarKind::Float))
            .collect::<Result<Vec<_>, _>>()?;
        let mut out = Vec::with_capacity(self.def.count * names.len());
        for row in self.data.chunks_exact(self.row_size) {
            for &at in &offsets {
                let mut word = [0u8; 4];
                word.copy_from_slice(&row[at..at + 4]);
                out.push(f32::from_le_bytes(word));
            }
        }
        Ok(out)
    }

    pub fn property_names(&self) -> impl Iterator<Item = &'a str> {
        let def: &'a ElementDef = self.def;
        def.properties.iter().map(|p| p.name.as_str())
    }
}

/// Splits the body into per-element views, checking every section is complete.
pub fn split_body<'a>(
    header: &'a PlyHeader,
    body: &'a [u8],
) -> Result<HashMap<&'a str, ElementView<'a>>, FoamError> {
    let mut views = HashMap::with_capacity(header.elements.len());
    let mut cursor = 0usize;
    for def in &header.elements {
        let row_size = def.row_size();
        let needed = def
            .count
            .checked_mul(row_size)
            .ok_or_else(|| FoamError::format("Overflow in byte calculation"))?;
        let available = body.len() - cursor;
        if available < needed {
            return Err(FoamError::format(format!(
                "Section '{}' is truncated, need {} bytes, have {}",
                def.name, needed, available
            )));
        }
        if row_size == 0 && def.count > 0 {
            return Err(FoamError::format(format!(
                "Element '{}' declares rows but no properties",
                def.name
            )));
        }
        views.insert(
            def.name.as_str(),
            ElementView {
                def,
                data: &body[cursor..cursor + needed],
                row_size: row_size.max(1),
            },
        );
        cursor += needed;
    }
    if cursor != body.len() {
        tracing::warn!(
            "{} trailing bytes after the last PLY element were ignored",
            body.len() - cursor
        );
    }
    Ok(views)
}

/// Appends a slice of plain values as little-endian bytes.
#[inline]
pub(crate) fn put<T: bytemuck::Pod>(output: &mut Vec<u8>, values: &[T]) {
    output.extend_from_slice(bytemuck::cast_slice(values));
}
