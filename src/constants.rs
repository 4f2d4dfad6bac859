/// Number of slots that can be stored in a page.
pub const SLOTS_PER_PAGE: usize = 512;

/// Size of a page's payload in bytes (512 slots of 8 bytes each).
pub const PAGE_DATA_SIZE: usize = SLOTS_PER_PAGE * 8;

/// RID written into the RID column of deleted (or invalidated) records.
/// Comparisons against this value are on the raw bit pattern.
pub const RID_TOMBSTONE: u64 = 0xFFFF_FFFF_FFFF_FFFF;

/// Indirection value meaning "no tail successor" / "end of chain".
pub const NO_INDIRECTION: u64 = 0;

/// Index of the indirection column (base and tail).
pub const INDIRECTION_COLUMN: usize = 0;

/// Index of the RID column (base and tail).
pub const RID_COLUMN: usize = 1;

/// Index of the insert/update timestamp column (base and tail).
pub const TIMESTAMP_COLUMN: usize = 2;

/// Index of the schema-encoding column (base and tail).
pub const SCHEMA_ENCODING_COLUMN: usize = 3;

/// Index of the base-RID backref column. Tail records only.
pub const BASE_RID_COLUMN: usize = 4;

/// Number of metadata columns in base pages. User columns start at this offset.
pub const NUM_BASE_METADATA_COLS: usize = 4;

/// Number of metadata columns in tail pages. User columns start at this offset.
pub const NUM_TAIL_METADATA_COLS: usize = 5;

/// Number of updates accumulated on a table before a merge is triggered.
pub const MERGE_THRESHOLD: usize = 10;

/// Default number of times a transaction is retried after an abort.
pub const RETRY_LIMIT: usize = 10;

/// Default number of pages the buffer pool keeps in memory.
pub const BP_MAX_PAGES: usize = 1000;
