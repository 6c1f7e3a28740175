//! sheet-store: append-only registration records kept in an `.xlsx` file.
//!
//! The store owns one workbook on disk and one named sheet inside it. Row 1
//! of that sheet is the header, every following row is one [`Record`] in the
//! order it was appended. Nothing is ever updated or deleted.
//!
//! Every mutation reads the whole file, changes it in memory and writes it
//! back atomically, so readers always see either the previous or the next
//! complete workbook.

mod error;
mod template;
mod workbook;
mod worksheet;

use std::{
    io,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use tracing::{debug, info};

pub use error::{Result, StoreError};
pub use workbook::Workbook;
pub use worksheet::Worksheet;

/// Sheet used when none is configured.
pub const DEFAULT_SHEET_NAME: &str = "Sheet1";

/// Header row, also the column order of every record row.
pub const HEADER: [&str; 7] = [
    "Name",
    "Surname",
    "Title",
    "Organization",
    "City",
    "Country",
    "Phone",
];

/// One registration submission. Fields are free text; an empty string means
/// the field was left blank or not sent at all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    pub name: String,
    pub surname: String,
    pub title: String,
    pub organization: String,
    pub city: String,
    pub country: String,
    pub phone: String,
}

impl Record {
    /// Field values in [`HEADER`] order.
    pub fn cells(&self) -> [&str; 7] {
        [
            self.name.as_str(),
            self.surname.as_str(),
            self.title.as_str(),
            self.organization.as_str(),
            self.city.as_str(),
            self.country.as_str(),
            self.phone.as_str(),
        ]
    }

    /// Builds a record from a sheet row; missing trailing cells are empty.
    pub fn from_cells<S: AsRef<str>>(cells: &[S]) -> Self {
        let cell = |i: usize| {
            cells
                .get(i)
                .map(|s| s.as_ref().to_owned())
                .unwrap_or_default()
        };
        Self {
            name: cell(0),
            surname: cell(1),
            title: cell(2),
            organization: cell(3),
            city: cell(4),
            country: cell(5),
            phone: cell(6),
        }
    }
}

/// Handle on a store file and the sheet that holds the records.
///
/// Appends through the same `SheetStore` are serialized by an internal lock.
/// Two processes (or two `SheetStore`s) writing the same file are not
/// coordinated.
#[derive(Debug)]
pub struct SheetStore {
    path: PathBuf,
    sheet_name: String,
    write_lock: Mutex<()>,
}

impl SheetStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            sheet_name: DEFAULT_SHEET_NAME.to_owned(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn with_sheet_name(mut self, sheet_name: impl Into<String>) -> Self {
        self.sheet_name = sheet_name.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sheet_name(&self) -> &str {
        &self.sheet_name
    }

    /// Opens the store file, creating whatever is missing.
    ///
    /// * no file: a new workbook with the sheet and the header row is written;
    /// * file without the sheet: the sheet is added with the header row;
    /// * file with the sheet: nothing is written and the existing first row
    ///   is left as it is, whatever it contains.
    ///
    /// A file that exists but cannot be parsed is reported as
    /// [`StoreError::Corrupt`] and left untouched.
    pub fn ensure_schema(&self) -> Result<Sheet> {
        let (mut book, mut created) = match self.load()? {
            Some(book) => (book, false),
            None => {
                info!(path = %self.path.display(), "store file not found, creating a new one");
                (Workbook::blank(&self.sheet_name), true)
            }
        };

        let part = match book
            .sheet_part(&self.sheet_name)
            .map_err(|e| self.classify(e))?
        {
            Some(part) => part,
            None => {
                info!(
                    path = %self.path.display(),
                    sheet = %self.sheet_name,
                    "sheet missing from store file, adding it"
                );
                created = true;
                book.add_worksheet(&self.sheet_name)
                    .map_err(|e| self.classify(e))?
            }
        };

        let mut sheet = Sheet {
            file: self.path.clone(),
            worksheet: book.worksheet(&part).map_err(|e| self.classify(e))?,
            book,
        };
        if created {
            sheet.worksheet.append_row(HEADER)?;
            sheet.persist()?;
        }
        Ok(sheet)
    }

    /// Appends `record` as the new last row and returns its row number.
    /// Returns only once the file on disk contains the row.
    pub fn append(&self, record: &Record) -> Result<u32> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut sheet = self.ensure_schema()?;
        sheet.append(record)
    }

    /// All rows of the sheet, header included. A missing file reads as no rows.
    pub fn rows(&self) -> Result<Vec<Vec<String>>> {
        let Some(book) = self.load()? else {
            return Ok(Vec::new());
        };
        let part = book
            .sheet_part(&self.sheet_name)
            .map_err(|e| self.classify(e))?
            .ok_or_else(|| StoreError::MissingSheet(self.sheet_name.clone()))?;
        let worksheet = book.worksheet(&part).map_err(|e| self.classify(e))?;
        worksheet.rows(&book.shared_strings()?)
    }

    /// Every record, i.e. every row after the header.
    pub fn records(&self) -> Result<Vec<Record>> {
        Ok(self
            .rows()?
            .iter()
            .skip(1)
            .map(|row| Record::from_cells(row))
            .collect())
    }

    /// `None` when the file does not exist.
    fn load(&self) -> Result<Option<Workbook>> {
        match Workbook::open(&self.path) {
            Ok(book) => Ok(Some(book)),
            Err(StoreError::Io(err)) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(self.classify(err)),
        }
    }

    fn classify(&self, err: StoreError) -> StoreError {
        if err.is_format_error() {
            StoreError::Corrupt {
                path: self.path.clone(),
                reason: err.to_string(),
            }
        } else {
            err
        }
    }
}

/// A loaded workbook positioned on the record sheet, returned by
/// [`SheetStore::ensure_schema`].
#[derive(Debug)]
pub struct Sheet {
    file: PathBuf,
    book: Workbook,
    worksheet: Worksheet,
}

impl Sheet {
    /// Appends `record` and rewrites the store file.
    ///
    /// If writing fails the file on disk keeps its previous content and this
    /// handle is rolled back to it as well.
    pub fn append(&mut self, record: &Record) -> Result<u32> {
        let before = self.worksheet.clone();
        let row = self.worksheet.append_row(record.cells())?;
        if let Err(err) = self.persist() {
            self.book.set_part(before.path(), before.xml().to_vec());
            self.worksheet = before;
            return Err(err);
        }
        debug!(path = %self.file.display(), row, "record appended");
        Ok(row)
    }

    /// Number of the last row, header included.
    pub fn row_count(&self) -> u32 {
        self.worksheet.last_row()
    }

    pub fn rows(&self) -> Result<Vec<Vec<String>>> {
        self.worksheet.rows(&self.book.shared_strings()?)
    }

    fn persist(&mut self) -> Result<()> {
        self.book
            .set_part(self.worksheet.path(), self.worksheet.xml().to_vec());
        self.book.save(&self.file)
    }
}
