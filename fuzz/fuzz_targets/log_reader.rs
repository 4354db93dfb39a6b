#![no_main]

use libfuzzer_sys::fuzz_target;
use regionlog_wal::{Error, LogReader};

fuzz_target!(|data: &[u8]| {
    // Whatever is on disk, the reader either yields entries, reports a torn
    // tail, or reports corruption. It never panics and never reads past
    // the file.
    let dir = match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(_) => return,
    };
    let path = dir.path().join("wal.00000000000000000001");
    if std::fs::write(&path, data).is_err() {
        return;
    }

    let rt = match tokio::runtime::Builder::new_current_thread().build() {
        Ok(rt) => rt,
        Err(_) => return,
    };
    rt.block_on(async {
        let Ok(mut reader) = LogReader::open(&path).await else {
            return;
        };
        loop {
            match reader.next_entry().await {
                Ok(Some(_)) => assert!(reader.position() <= data.len() as u64),
                Ok(None) => break,
                Err(Error::TruncatedRecord { .. }) | Err(Error::CorruptRecord { .. }) => break,
                Err(Error::Codec(_)) | Err(Error::Io(_)) => break,
                Err(e) => panic!("unexpected reader error: {}", e),
            }
        }
        // Exhausted readers stay exhausted
        assert!(matches!(reader.next_entry().await, Ok(None)));
    });
});
