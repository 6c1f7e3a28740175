use ::zip as zip_crate;
use memchr::memmem;
use quick_xml::{
    Reader,
    escape::{escape, unescape},
    events::{BytesStart, Event},
};
use std::{
    fs::{self, File},
    io::{Read, Write},
    path::Path,
};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::template::{
    self, CONTENT_TYPES_PATH, SHARED_STRINGS_PATH, WORKBOOK_PATH, WORKBOOK_RELS_PATH,
    WORKSHEET_CONTENT_TYPE, WORKSHEET_REL_TYPE,
};
use crate::worksheet::{Worksheet, parse_shared_strings};

/// An `.xlsx` package held entirely in memory.
///
/// Every part of the archive is kept as raw bytes in its original order, so
/// saving writes back exactly what was read except for the parts that were
/// replaced or added in between.
#[derive(Debug, Clone)]
pub struct Workbook {
    parts: Vec<(String, Vec<u8>)>,
}

impl Workbook {
    /// A fresh workbook with a single empty sheet called `sheet_name`.
    pub fn blank(sheet_name: &str) -> Self {
        Self {
            parts: template::blank_parts(sheet_name),
        }
    }

    /// Reads every part of the archive at `src`.
    ///
    /// A missing file surfaces as [`StoreError::Io`] with `NotFound`, so the
    /// caller can tell "absent" apart from "unreadable".
    pub fn open<P: AsRef<Path>>(src: P) -> Result<Self> {
        let mut zip = zip_crate::ZipArchive::new(File::open(src.as_ref())?)?;

        let mut parts = Vec::with_capacity(zip.len());
        for i in 0..zip.len() {
            let mut entry = zip.by_index(i)?;
            if entry.is_dir() {
                continue;
            }
            let name = entry.name().to_owned();
            let mut buf = Vec::with_capacity(entry.size() as usize);
            // битый deflate-поток или CRC приходят как io::Error
            entry
                .read_to_end(&mut buf)
                .map_err(|e| StoreError::malformed(&name, e.to_string()))?;
            parts.push((name, buf));
        }

        let book = Self { parts };
        if book.part(WORKBOOK_PATH).is_none() {
            return Err(StoreError::MissingPart(WORKBOOK_PATH.to_owned()));
        }
        Ok(book)
    }

    pub fn part(&self, path: &str) -> Option<&[u8]> {
        self.parts
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, content)| content.as_slice())
    }

    /// Replaces the content of `path`, or adds it at the end of the archive.
    pub fn set_part(&mut self, path: &str, content: Vec<u8>) {
        if let Some(pair) = self.parts.iter_mut().find(|(p, _)| p == path) {
            pair.1 = content;
        } else {
            self.parts.push((path.to_owned(), content));
        }
    }

    fn required_part(&self, path: &str) -> Result<&[u8]> {
        self.part(path)
            .ok_or_else(|| StoreError::MissingPart(path.to_owned()))
    }

    /// Sheet names in tab order.
    pub fn sheet_names(&self) -> Result<Vec<String>> {
        Ok(self
            .sheet_entries()?
            .into_iter()
            .map(|(name, _)| name)
            .collect())
    }

    /// Archive path of the worksheet called `sheet_name`, if the workbook has one.
    /// Names match regardless of case, as they do in Excel.
    pub fn sheet_part(&self, sheet_name: &str) -> Result<Option<String>> {
        let Some((_, rid)) = self
            .sheet_entries()?
            .into_iter()
            .find(|(name, _)| same_sheet_name(name, sheet_name))
        else {
            return Ok(None);
        };

        let rels_xml = self.required_part(WORKBOOK_RELS_PATH)?;
        let mut rdr = Reader::from_reader(rels_xml);
        rdr.config_mut().trim_text(true);
        loop {
            match rdr.read_event()? {
                Event::Empty(ref e) | Event::Start(ref e)
                    if e.local_name().as_ref() == b"Relationship" =>
                {
                    if attr(e, b"Id").as_deref() == Some(rid.as_str()) {
                        let target = attr(e, b"Target").ok_or_else(|| {
                            StoreError::malformed(WORKBOOK_RELS_PATH, "relationship without Target")
                        })?;
                        return Ok(Some(resolve_target(&target)));
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }
        Err(StoreError::malformed(
            WORKBOOK_RELS_PATH,
            format!("relationship {rid} for sheet '{sheet_name}' not found"),
        ))
    }

    /// Loads the worksheet stored at `part` for editing.
    pub fn worksheet(&self, part: &str) -> Result<Worksheet> {
        Worksheet::new(part.to_owned(), self.required_part(part)?.to_vec())
    }

    /// Shared string table, empty when the workbook has none.
    pub fn shared_strings(&self) -> Result<Vec<String>> {
        match self.part(SHARED_STRINGS_PATH) {
            Some(xml) => parse_shared_strings(xml),
            None => Ok(Vec::new()),
        }
    }

    /// Adds an empty worksheet named `sheet_name` after the existing ones and
    /// returns its archive path.
    pub fn add_worksheet(&mut self, sheet_name: &str) -> Result<String> {
        if self
            .sheet_names()?
            .iter()
            .any(|n| same_sheet_name(n, sheet_name))
        {
            return Err(StoreError::malformed(
                WORKBOOK_PATH,
                format!("sheet '{sheet_name}' already exists"),
            ));
        }

        let mut wb_xml = self.required_part(WORKBOOK_PATH)?.to_vec();
        let mut rels_xml = self.required_part(WORKBOOK_RELS_PATH)?.to_vec();
        let mut types_xml = self.required_part(CONTENT_TYPES_PATH)?.to_vec();

        // -------- 1) свободные sheetId / rId ----------
        let mut max_sheet_id = 0u32;
        let mut rdr = Reader::from_reader(wb_xml.as_slice());
        rdr.config_mut().trim_text(true);
        loop {
            match rdr.read_event()? {
                Event::Empty(ref e) | Event::Start(ref e) if e.local_name().as_ref() == b"sheet" => {
                    if let Some(id) = attr(e, b"sheetId") {
                        max_sheet_id = max_sheet_id.max(id.parse::<u32>().unwrap_or(0));
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        let mut max_rid = 0u32;
        let mut rdr = Reader::from_reader(rels_xml.as_slice());
        rdr.config_mut().trim_text(true);
        loop {
            match rdr.read_event()? {
                Event::Empty(ref e) | Event::Start(ref e)
                    if e.local_name().as_ref() == b"Relationship" =>
                {
                    if let Some(num) = attr(e, b"Id")
                        .as_deref()
                        .and_then(|id| id.strip_prefix("rId"))
                        .and_then(|n| n.parse::<u32>().ok())
                    {
                        max_rid = max_rid.max(num);
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        // -------- 2) свободный sheet#.xml ----------
        let max_sheet_file = self
            .parts
            .iter()
            .filter_map(|(path, _)| {
                path.strip_prefix("xl/worksheets/sheet")
                    .and_then(|s| s.strip_suffix(".xml"))
                    .and_then(|s| s.parse::<usize>().ok())
            })
            .max()
            .unwrap_or(0);
        let new_sheet_file = max_sheet_file + 1;
        let new_sheet_path = format!("xl/worksheets/sheet{new_sheet_file}.xml");

        // -------- 3) новые теги ----------
        let sheet_tag = format!(
            r#"<sheet name="{}" sheetId="{}" r:id="rId{}"/>"#,
            escape(sheet_name),
            max_sheet_id + 1,
            max_rid + 1
        );
        let rel_tag = format!(
            r#"<Relationship Id="rId{}" Type="{WORKSHEET_REL_TYPE}" Target="worksheets/sheet{new_sheet_file}.xml"/>"#,
            max_rid + 1
        );
        let override_tag = format!(
            r#"<Override PartName="/{new_sheet_path}" ContentType="{WORKSHEET_CONTENT_TYPE}"/>"#
        );

        insert_before_last(&mut wb_xml, b"</sheets>", sheet_tag.as_bytes(), WORKBOOK_PATH)?;
        insert_before_last(
            &mut rels_xml,
            b"</Relationships>",
            rel_tag.as_bytes(),
            WORKBOOK_RELS_PATH,
        )?;
        insert_before_last(
            &mut types_xml,
            b"</Types>",
            override_tag.as_bytes(),
            CONTENT_TYPES_PATH,
        )?;

        self.set_part(WORKBOOK_PATH, wb_xml);
        self.set_part(WORKBOOK_RELS_PATH, rels_xml);
        self.set_part(CONTENT_TYPES_PATH, types_xml);
        self.set_part(&new_sheet_path, template::EMPTY_SHEET.as_bytes().to_vec());

        debug!(sheet = sheet_name, part = %new_sheet_path, "worksheet added");
        Ok(new_sheet_path)
    }

    /// Writes the whole package to `dst`.
    ///
    /// The archive is built in a temporary file next to `dst`, flushed to disk
    /// and renamed over the target, so `dst` is either the old workbook or the
    /// new one and never a half-written zip.
    pub fn save<P: AsRef<Path>>(&self, dst: P) -> Result<()> {
        let dst = dst.as_ref();
        let dir = match dst.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let mut tmp = NamedTempFile::new_in(dir)?;
        {
            let mut zout = zip_crate::ZipWriter::new(&mut tmp);
            let opt: zip_crate::write::FileOptions<'_, ()> =
                zip_crate::write::FileOptions::default()
                    .compression_method(zip_crate::CompressionMethod::Deflated);

            for (name, content) in &self.parts {
                zout.start_file(name.as_str(), opt)?;
                zout.write_all(content)?;
            }
            zout.finish()?;
        }

        // NamedTempFile создаётся с 0600, сохраняем права исходного файла
        match fs::metadata(dst) {
            Ok(meta) => tmp.as_file().set_permissions(meta.permissions())?,
            Err(_) => set_default_permissions(tmp.as_file())?,
        }
        tmp.as_file().sync_all()?;
        tmp.persist(dst).map_err(|e| e.error)?;

        debug!(path = %dst.display(), parts = self.parts.len(), "workbook written");
        Ok(())
    }

    /// `(name, r:id)` of every `<sheet>` in `xl/workbook.xml`.
    fn sheet_entries(&self) -> Result<Vec<(String, String)>> {
        let wb_xml = self.required_part(WORKBOOK_PATH)?;
        let mut rdr = Reader::from_reader(wb_xml);
        rdr.config_mut().trim_text(true);

        let mut sheets = Vec::new();
        loop {
            match rdr.read_event()? {
                Event::Empty(ref e) | Event::Start(ref e) if e.local_name().as_ref() == b"sheet" => {
                    let name = attr(e, b"name");
                    let rid = e.attributes().with_checks(false).flatten().find_map(|a| {
                        (a.key.local_name().as_ref() == b"id" && a.key.prefix().is_some())
                            .then(|| String::from_utf8_lossy(&a.value).into_owned())
                    });
                    match (name, rid) {
                        (Some(name), Some(rid)) => sheets.push((name, rid)),
                        _ => {
                            return Err(StoreError::malformed(
                                WORKBOOK_PATH,
                                "<sheet> without name or r:id",
                            ));
                        }
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }
        Ok(sheets)
    }
}

// Excel не различает регистр в именах листов
fn same_sheet_name(a: &str, b: &str) -> bool {
    a.chars()
        .flat_map(char::to_lowercase)
        .eq(b.chars().flat_map(char::to_lowercase))
}

/// Unescaped value of the attribute `key`.
pub(crate) fn attr(e: &BytesStart<'_>, key: &[u8]) -> Option<String> {
    e.attributes().with_checks(false).flatten().find_map(|a| {
        (a.key.as_ref() == key).then(|| {
            let raw = String::from_utf8_lossy(&a.value);
            match unescape(&raw) {
                Ok(value) => value.into_owned(),
                Err(_) => raw.into_owned(),
            }
        })
    })
}

/// Splices `fragment` right before the last occurrence of `closing`.
pub(crate) fn insert_before_last(
    xml: &mut Vec<u8>,
    closing: &[u8],
    fragment: &[u8],
    part: &str,
) -> Result<()> {
    let pos = memmem::rfind(xml, closing).ok_or_else(|| {
        StoreError::malformed(
            part,
            format!("{} not found", String::from_utf8_lossy(closing)),
        )
    })?;
    xml.splice(pos..pos, fragment.iter().copied());
    Ok(())
}

/// Relationship targets are relative to `xl/` unless they start with `/`.
fn resolve_target(target: &str) -> String {
    match target.strip_prefix('/') {
        Some(absolute) => absolute.to_owned(),
        None => format!("xl/{target}"),
    }
}

#[cfg(unix)]
fn set_default_permissions(file: &File) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn set_default_permissions(_file: &File) -> std::io::Result<()> {
    Ok(())
}
