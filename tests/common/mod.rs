use std::sync::Once;
use std::time::{Duration, Instant};

use lstore::Table;

static INIT: Once = Once::new();

pub fn setup() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// Block until the table's background merge has finished, or panic after
/// `timeout`.
#[allow(dead_code)]
pub fn wait_for_merge(table: &Table, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while table.merge_in_progress() {
        if Instant::now() > deadline {
            panic!("merge did not finish within {:?}", timeout);
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}
