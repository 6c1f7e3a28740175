use memchr::memmem;
use quick_xml::{
    Reader, Writer,
    escape::unescape,
    events::{BytesStart, BytesText, Event},
};
use regex::{Captures, Regex};
use std::{borrow::Cow, fmt::Write as _, sync::LazyLock};

use crate::error::{Result, StoreError};
use crate::workbook::{attr, insert_before_last};

static CELL_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\$?([A-Za-z]{1,3})\$?(\d+)$").expect("valid cell ref pattern"));
static EMPTY_SHEET_DATA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<sheetData\s*/>").expect("valid sheetData pattern"));
static XSTRING_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_x([0-9A-Fa-f]{4})_").expect("valid escape pattern"));

/// Last row a worksheet can have.
pub const MAX_ROWS: u32 = 1_048_576;

/// One worksheet part (`xl/worksheets/sheetN.xml`) opened for appending.
#[derive(Debug, Clone)]
pub struct Worksheet {
    path: String,
    xml: Vec<u8>,
    last_row: u32,
}

impl Worksheet {
    pub(crate) fn new(path: String, xml: Vec<u8>) -> Result<Self> {
        let last_row = calc_last_row(&xml, &path)?;
        Ok(Self {
            path,
            xml,
            last_row,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn xml(&self) -> &[u8] {
        &self.xml
    }

    /// Number of the last `<row>` in the sheet, 0 for an empty one.
    pub fn last_row(&self) -> u32 {
        self.last_row
    }

    /// Appends a row after the current last row and returns its number.
    ///
    /// Every value is written as an inline string, so phone numbers, leading
    /// zeros and anything starting with `=` stay text. Empty values produce
    /// no `<c>` element at all. Control characters XML cannot carry are
    /// written as `_xHHHH_` escapes and come back unchanged from [`rows`].
    ///
    /// [`rows`]: Worksheet::rows
    pub fn append_row<I, S>(&mut self, cells: I) -> Result<u32>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if self.last_row >= MAX_ROWS {
            return Err(StoreError::malformed(
                &self.path,
                format!("sheet already has {MAX_ROWS} rows"),
            ));
        }
        let row_num = self.last_row + 1;
        let mut writer = Writer::new(Vec::new());

        writer
            .create_element("row")
            .with_attribute(("r", row_num.to_string().as_str()))
            .write_inner_content(|w| {
                for (col_idx, val) in cells.into_iter().enumerate() {
                    let val = val.as_ref();
                    if val.is_empty() {
                        continue;
                    }
                    let text = encode_xstring(val);
                    let coord = format!("{}{}", col_idx_to_letters(col_idx), row_num);
                    w.create_element("c")
                        .with_attribute(("r", coord.as_str()))
                        .with_attribute(("t", "inlineStr"))
                        .write_inner_content(|w2| {
                            w2.create_element("is").write_inner_content(|w3| {
                                w3.create_element("t")
                                    .with_attribute(("xml:space", "preserve"))
                                    .write_text_content(BytesText::new(text.as_ref()))?;
                                Ok(())
                            })?;
                            Ok(())
                        })?;
                }
                Ok(())
            })?;

        let new_row_xml = writer.into_inner();

        // Excel пишет пустой лист как <sheetData/>
        if memmem::find(&self.xml, b"</sheetData>").is_none() {
            let expanded = EMPTY_SHEET_DATA
                .replace(
                    std::str::from_utf8(&self.xml)
                        .map_err(|e| StoreError::malformed(&self.path, e.to_string()))?,
                    "<sheetData></sheetData>",
                )
                .into_owned();
            self.xml = expanded.into_bytes();
        }
        insert_before_last(&mut self.xml, b"</sheetData>", &new_row_xml, &self.path)?;

        self.last_row = row_num;
        Ok(row_num)
    }

    /// Cell values of every row, in row order.
    ///
    /// `rows[i]` is row `i + 1`; rows missing from the XML come back empty, as
    /// do cells missing inside a row. `shared` is the workbook's shared string
    /// table, needed for cells of type `s`.
    pub fn rows(&self, shared: &[String]) -> Result<Vec<Vec<String>>> {
        let mut rdr = Reader::from_reader(self.xml.as_slice());

        let mut rows: Vec<Vec<String>> = Vec::new();
        let mut row: Option<Vec<String>> = None;
        let mut cell: Option<CellCursor> = None;
        let mut next_col = 0usize;
        let mut capture = false;
        let mut phonetic = false;

        loop {
            match rdr.read_event()? {
                Event::Start(ref e) => match e.local_name().as_ref() {
                    b"row" => {
                        pad_rows(&mut rows, row_number(e, &self.path)?);
                        row = Some(Vec::new());
                        next_col = 0;
                    }
                    b"c" => {
                        let c = CellCursor::open(e, next_col);
                        next_col = c.col + 1;
                        cell = Some(c);
                    }
                    b"v" | b"t" => capture = cell.is_some(),
                    b"rPh" => phonetic = true,
                    _ => {}
                },
                Event::Empty(ref e) => match e.local_name().as_ref() {
                    b"row" => {
                        pad_rows(&mut rows, row_number(e, &self.path)?);
                        rows.push(Vec::new());
                    }
                    b"c" => next_col = CellCursor::open(e, next_col).col + 1,
                    _ => {}
                },
                Event::Text(ref t) if capture && !phonetic => {
                    if let Some(c) = cell.as_mut() {
                        let raw = std::str::from_utf8(t)
                            .map_err(|e| StoreError::malformed(&self.path, e.to_string()))?;
                        let text = unescape(raw)
                            .map_err(|e| StoreError::malformed(&self.path, e.to_string()))?;
                        c.text.push_str(&text);
                    }
                }
                Event::CData(ref t) if capture && !phonetic => {
                    if let Some(c) = cell.as_mut() {
                        c.text.push_str(&String::from_utf8_lossy(t));
                    }
                }
                Event::GeneralRef(ref r) if capture && !phonetic => {
                    if let Some(c) = cell.as_mut() {
                        c.text.push_str(&resolve_entity(r, &self.path)?);
                    }
                }
                Event::End(ref e) => match e.local_name().as_ref() {
                    b"v" | b"t" => capture = false,
                    b"rPh" => phonetic = false,
                    b"c" => {
                        if let (Some(c), Some(cells)) = (cell.take(), row.as_mut()) {
                            let col = c.col;
                            let value = c.finish(shared, &self.path)?;
                            if cells.len() <= col {
                                cells.resize(col + 1, String::new());
                            }
                            cells[col] = value;
                        }
                    }
                    b"row" => {
                        if let Some(cells) = row.take() {
                            rows.push(cells);
                        }
                    }
                    _ => {}
                },
                Event::Eof => break,
                _ => {}
            }
        }
        Ok(rows)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CellKind {
    Shared,
    Inline,
    Plain,
}

struct CellCursor {
    col: usize,
    kind: CellKind,
    text: String,
}

impl CellCursor {
    fn open(e: &BytesStart<'_>, next_col: usize) -> Self {
        let col = attr(e, b"r")
            .as_deref()
            .and_then(parse_cell_ref)
            .map(|(col, _)| col)
            .unwrap_or(next_col);
        let kind = match attr(e, b"t").as_deref() {
            Some("s") => CellKind::Shared,
            Some("inlineStr") => CellKind::Inline,
            _ => CellKind::Plain,
        };
        Self {
            col,
            kind,
            text: String::new(),
        }
    }

    fn finish(self, shared: &[String], part: &str) -> Result<String> {
        match self.kind {
            CellKind::Shared => {
                let idx: usize = self.text.trim().parse().map_err(|_| {
                    StoreError::malformed(part, format!("bad shared string index '{}'", self.text))
                })?;
                shared.get(idx).cloned().ok_or_else(|| {
                    StoreError::malformed(part, format!("shared string {idx} out of range"))
                })
            }
            CellKind::Inline | CellKind::Plain => Ok(decode_xstring(self.text)),
        }
    }
}

/// Parses `xl/sharedStrings.xml` into its `<si>` entries, rich text runs
/// concatenated and phonetic hints dropped.
pub(crate) fn parse_shared_strings(xml: &[u8]) -> Result<Vec<String>> {
    const PART: &str = "xl/sharedStrings.xml";
    let mut rdr = Reader::from_reader(xml);

    let mut strings = Vec::new();
    let mut current: Option<String> = None;
    let mut capture = false;
    let mut phonetic = false;

    loop {
        match rdr.read_event()? {
            Event::Start(ref e) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => capture = current.is_some(),
                b"rPh" => phonetic = true,
                _ => {}
            },
            Event::Empty(ref e) if e.local_name().as_ref() == b"si" => strings.push(String::new()),
            Event::Text(ref t) if capture && !phonetic => {
                if let Some(s) = current.as_mut() {
                    let raw = std::str::from_utf8(t)
                        .map_err(|e| StoreError::malformed(PART, e.to_string()))?;
                    s.push_str(
                        &unescape(raw).map_err(|e| StoreError::malformed(PART, e.to_string()))?,
                    );
                }
            }
            Event::GeneralRef(ref r) if capture && !phonetic => {
                if let Some(s) = current.as_mut() {
                    s.push_str(&resolve_entity(r, PART)?);
                }
            }
            Event::End(ref e) => match e.local_name().as_ref() {
                b"t" => capture = false,
                b"rPh" => phonetic = false,
                b"si" => {
                    if let Some(s) = current.take() {
                        strings.push(decode_xstring(s));
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(strings)
}

// маленький хелпер
fn calc_last_row(sheet_xml: &[u8], part: &str) -> Result<u32> {
    let mut rdr = Reader::from_reader(sheet_xml);
    rdr.config_mut().trim_text(true);

    let mut current = 0u32;
    let mut last_row = 0u32;
    loop {
        match rdr.read_event()? {
            Event::Empty(ref e) | Event::Start(ref e) if e.local_name().as_ref() == b"row" => {
                current = match row_number(e, part)? {
                    Some(n) => n,
                    None if current < MAX_ROWS => current + 1,
                    None => {
                        return Err(StoreError::malformed(
                            part,
                            format!("more than {MAX_ROWS} rows"),
                        ));
                    }
                };
                last_row = last_row.max(current);
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(last_row)
}

fn row_number(e: &BytesStart<'_>, part: &str) -> Result<Option<u32>> {
    let Some(n) = attr(e, b"r").and_then(|r| r.parse::<u64>().ok()) else {
        return Ok(None);
    };
    if n == 0 || n > u64::from(MAX_ROWS) {
        return Err(StoreError::malformed(part, format!("row number {n} out of range")));
    }
    Ok(Some(n as u32))
}

/// Pads `rows` so that the next pushed row lands at position `number`.
fn pad_rows(rows: &mut Vec<Vec<String>>, number: Option<u32>) {
    if let Some(number) = number {
        while rows.len() + 1 < number as usize {
            rows.push(Vec::new());
        }
    }
}

/// Characters XML 1.0 does not allow in a document, even as references.
fn is_forbidden_in_xml(ch: char) -> bool {
    matches!(
        ch,
        '\u{0}'..='\u{8}' | '\u{B}' | '\u{C}' | '\u{E}'..='\u{1F}' | '\u{FFFE}' | '\u{FFFF}'
    )
}

/// `_x` + 4 hex digits + `_` at the start of `s`.
fn starts_with_escape(s: &str) -> bool {
    let b = s.as_bytes();
    b.len() >= 7
        && b[0] == b'_'
        && b[1] == b'x'
        && b[2..6].iter().all(u8::is_ascii_hexdigit)
        && b[6] == b'_'
}

/// Encodes `s` as an `ST_Xstring`: forbidden characters become `_xHHHH_`,
/// and an `_` that would otherwise start such an escape becomes `_x005F_`.
pub(crate) fn encode_xstring(s: &str) -> Cow<'_, str> {
    if !s.contains("_x") && !s.chars().any(is_forbidden_in_xml) {
        return Cow::Borrowed(s);
    }
    let mut out = String::with_capacity(s.len() + 16);
    for (i, ch) in s.char_indices() {
        if is_forbidden_in_xml(ch) {
            let _ = write!(out, "_x{:04X}_", ch as u32);
        } else if ch == '_' && starts_with_escape(&s[i..]) {
            out.push_str("_x005F_");
        } else {
            out.push(ch);
        }
    }
    Cow::Owned(out)
}

/// Reverse of [`encode_xstring`]; escapes that name no character are kept.
pub(crate) fn decode_xstring(s: String) -> String {
    if !s.contains("_x") {
        return s;
    }
    XSTRING_ESCAPE
        .replace_all(&s, |caps: &Captures<'_>| {
            u32::from_str_radix(&caps[1], 16)
                .ok()
                .and_then(char::from_u32)
                .map(String::from)
                .unwrap_or_else(|| caps[0].to_owned())
        })
        .into_owned()
}

fn resolve_entity(r: &[u8], part: &str) -> Result<String> {
    let name =
        std::str::from_utf8(r).map_err(|e| StoreError::malformed(part, e.to_string()))?;
    let resolved = if let Some(num) = name.strip_prefix('#') {
        let code = match num.strip_prefix(['x', 'X']) {
            Some(hex) => u32::from_str_radix(hex, 16).ok(),
            None => num.parse::<u32>().ok(),
        };
        code.and_then(char::from_u32).map(String::from)
    } else {
        match name {
            "lt" => Some("<".to_owned()),
            "gt" => Some(">".to_owned()),
            "amp" => Some("&".to_owned()),
            "apos" => Some("'".to_owned()),
            "quot" => Some("\"".to_owned()),
            _ => None,
        }
    };
    resolved.ok_or_else(|| StoreError::malformed(part, format!("unknown entity &{name};")))
}

/// `"C7"` → `(2, 7)`: 0-based column, 1-based row.
pub(crate) fn parse_cell_ref(coord: &str) -> Option<(usize, u32)> {
    let caps = CELL_REF.captures(coord)?;
    let col = letters_to_col_idx(&caps[1]);
    let row = caps[2].parse().ok()?;
    Some((col, row))
}

// 0 -> "A", 26 -> "AA"
pub(crate) fn col_idx_to_letters(mut idx: usize) -> String {
    let mut s = String::new();
    loop {
        let rem = idx % 26;
        s.insert(0, (b'A' + rem as u8) as char);
        if idx < 26 {
            break;
        }
        idx = idx / 26 - 1;
    }
    s
}

fn letters_to_col_idx(s: &str) -> usize {
    s.bytes()
        .fold(0, |acc, b| acc * 26 + (b.to_ascii_uppercase() - b'A' + 1) as usize)
        - 1
}
