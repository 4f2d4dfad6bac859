use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info};

use crate::constants::PAGE_DATA_SIZE;
use crate::errors::DatabaseError;
use crate::page::Page;
use crate::table::{Table, TableStorage, RID};

/// Table registry with best-effort persistence: `close` writes every table's
/// pages and metadata under the open path, `open` loads them back and rebuilds
/// the indexes.
pub struct Database {
    path: Option<PathBuf>,
    tables: Vec<Arc<Table>>,
}

impl Database {
    pub fn new() -> Self {
        Database {
            path: None,
            tables: Vec::new(),
        }
    }

    /// Open the database at `path`, creating the directory for a new database
    /// or loading every `*_meta.bin` table found in an existing one.
    pub fn open(&mut self, path: impl Into<PathBuf>) -> Result<(), DatabaseError> {
        let path = path.into();

        if !path.exists() {
            fs::create_dir_all(&path)?;
            self.path = Some(path);
            return Ok(());
        }

        for entry in fs::read_dir(&path)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if let Some(table_name) = file_name.strip_suffix("_meta.bin") {
                let table = load_table(&path, table_name)?;
                info!("loaded table {} from {:?}", table_name, path);
                self.tables.push(Arc::new(table));
            }
        }

        self.path = Some(path);
        Ok(())
    }

    /// Persist every table. Waits for in-flight merges so the written state is
    /// a consistent snapshot.
    pub fn close(&self) -> Result<(), DatabaseError> {
        let path = match &self.path {
            Some(path) => path,
            None => return Ok(()),
        };

        for table in &self.tables {
            while table.merge_in_progress() {
                thread::sleep(Duration::from_millis(1));
            }
            save_table(path, table)?;
            debug!("persisted table {}", table.name);
        }
        Ok(())
    }

    pub fn create_table(&mut self, name: &str, num_columns: usize, key_column: usize) -> Arc<Table> {
        let table = Arc::new(Table::new(name, num_columns, key_column));
        self.tables.push(Arc::clone(&table));
        table
    }

    pub fn drop_table(&mut self, name: &str) -> bool {
        let before = self.tables.len();
        self.tables.retain(|table| table.name != name);
        self.tables.len() != before
    }

    pub fn get_table(&self, name: &str) -> Option<Arc<Table>> {
        self.tables
            .iter()
            .find(|table| table.name == name)
            .map(Arc::clone)
    }
}

impl Default for Database {
    fn default() -> Self {
        Database::new()
    }
}

fn write_u32(writer: &mut impl Write, value: u32) -> Result<(), DatabaseError> {
    writer.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn write_u64(writer: &mut impl Write, value: u64) -> Result<(), DatabaseError> {
    writer.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn read_u32(reader: &mut impl Read) -> Result<u32, DatabaseError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(reader: &mut impl Read) -> Result<u64, DatabaseError> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn save_table(dir: &Path, table: &Arc<Table>) -> Result<(), DatabaseError> {
    let storage = table.storage();
    let base_path = dir.join(&table.name);

    // Metadata: counters, live RIDs, and which columns are indexed.
    let mut meta = BufWriter::new(File::create(with_suffix(&base_path, "_meta.bin"))?);
    let name_bytes = table.name.as_bytes();
    write_u32(&mut meta, name_bytes.len() as u32)?;
    meta.write_all(name_bytes)?;
    write_u32(&mut meta, storage.num_columns as u32)?;
    write_u32(&mut meta, storage.key_column as u32)?;
    write_u32(&mut meta, storage.next_rid as u32)?;
    write_u32(&mut meta, storage.next_base_position as u32)?;
    write_u32(&mut meta, storage.next_tail_position as u32)?;
    write_u32(&mut meta, storage.base_rids.len() as u32)?;
    for &rid in &storage.base_rids {
        write_u64(&mut meta, rid)?;
    }
    let indexed = storage.index.indexed_columns();
    write_u32(&mut meta, indexed.len() as u32)?;
    for column in indexed {
        write_u32(&mut meta, column as u32)?;
    }
    meta.flush()?;

    save_pages(&with_suffix(&base_path, "_base.bin"), &storage.base_pages)?;
    save_pages(&with_suffix(&base_path, "_tail.bin"), &storage.tail_pages)?;

    let mut dir_file = BufWriter::new(File::create(with_suffix(&base_path, "_dir.bin"))?);
    write_u32(&mut dir_file, storage.page_directory.len() as u32)?;
    for (&rid, &(page_index, slot)) in &storage.page_directory {
        write_u64(&mut dir_file, rid)?;
        write_u32(&mut dir_file, page_index as u32)?;
        write_u32(&mut dir_file, slot as u32)?;
    }
    dir_file.flush()?;

    Ok(())
}

fn save_pages(path: &Path, columns: &[Vec<Page>]) -> Result<(), DatabaseError> {
    let mut writer = BufWriter::new(File::create(path)?);
    write_u32(&mut writer, columns.len() as u32)?;
    for column in columns {
        write_u32(&mut writer, column.len() as u32)?;
        for page in column {
            write_u32(&mut writer, page.num_records() as u32)?;
            writer.write_all(page.data())?;
        }
    }
    writer.flush()?;
    Ok(())
}

fn load_table(dir: &Path, name: &str) -> Result<Table, DatabaseError> {
    let base_path = dir.join(name);

    let mut meta = BufReader::new(File::open(with_suffix(&base_path, "_meta.bin"))?);
    let name_len = read_u32(&mut meta)? as usize;
    let mut name_buf = vec![0u8; name_len];
    meta.read_exact(&mut name_buf)?;

    let num_columns = read_u32(&mut meta)? as usize;
    let key_column = read_u32(&mut meta)? as usize;
    let next_rid = read_u32(&mut meta)? as RID;
    let next_base_position = read_u32(&mut meta)? as usize;
    let next_tail_position = read_u32(&mut meta)? as usize;

    let n_base_rids = read_u32(&mut meta)? as usize;
    let mut base_rids = HashSet::with_capacity(n_base_rids);
    for _ in 0..n_base_rids {
        base_rids.insert(read_u64(&mut meta)?);
    }

    let n_indexed = read_u32(&mut meta)? as usize;
    let mut indexed_columns = Vec::with_capacity(n_indexed);
    for _ in 0..n_indexed {
        indexed_columns.push(read_u32(&mut meta)? as usize);
    }

    let mut storage = TableStorage::new(num_columns, key_column);
    storage.next_rid = next_rid;
    storage.next_base_position = next_base_position;
    storage.next_tail_position = next_tail_position;
    storage.base_rids = base_rids;
    storage.base_pages = load_pages(&with_suffix(&base_path, "_base.bin"))?;
    storage.tail_pages = load_pages(&with_suffix(&base_path, "_tail.bin"))?;

    let mut dir_file = BufReader::new(File::open(with_suffix(&base_path, "_dir.bin"))?);
    let n_entries = read_u32(&mut dir_file)? as usize;
    let mut page_directory = HashMap::with_capacity(n_entries);
    for _ in 0..n_entries {
        let rid = read_u64(&mut dir_file)?;
        let page_index = read_u32(&mut dir_file)? as usize;
        let slot = read_u32(&mut dir_file)? as usize;
        page_directory.insert(rid, (page_index, slot));
    }
    storage.page_directory = page_directory;

    // Indexes are not persisted; rebuild them from the loaded records.
    for column in indexed_columns {
        storage.create_index(column)?;
    }

    Ok(Table::from_storage(name, storage))
}

fn load_pages(path: &Path) -> Result<Vec<Vec<Page>>, DatabaseError> {
    let mut reader = BufReader::new(File::open(path)?);
    let num_cols = read_u32(&mut reader)? as usize;

    let mut columns = Vec::with_capacity(num_cols);
    for _ in 0..num_cols {
        let n_pages = read_u32(&mut reader)? as usize;
        let mut pages = Vec::with_capacity(n_pages);
        for _ in 0..n_pages {
            let num_records = read_u32(&mut reader)? as usize;
            let mut data = vec![0u8; PAGE_DATA_SIZE];
            reader.read_exact(&mut data)?;
            pages.push(Page::from_parts(&data, num_records));
        }
        columns.push(pages);
    }

    Ok(columns)
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    base.with_file_name(name)
}
