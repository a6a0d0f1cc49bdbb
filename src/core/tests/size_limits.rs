//! Data-file rollover under a small `max_file_size`, mirroring the teacher's
//! `size_limits.rs::writer_rolls_data_files_when_the_limit_is_exceeded` and its reload variant.

use pretty_assertions::assert_eq;
use tempfile::tempdir;

use crate::config::QueueOptions;
use crate::core::{DataFileState, QueueCore};

#[tokio::test]
async fn writer_rolls_data_files_when_the_limit_is_exceeded() {
    let dir = tempdir().unwrap();
    let options = QueueOptions::from_path(dir.path())
        .max_file_size(16)
        .build()
        .unwrap();
    let core = QueueCore::open(options).await.unwrap();

    let mut writer = core.open_session();
    writer.enqueue(vec![1u8; 10]).await.unwrap();
    writer.flush().await.unwrap();
    assert_eq!(core.file_state(0), Some(DataFileState::Active));

    // The first data file only has 6 bytes of room left; this flush's 10-byte write can't fit
    // and must roll to data.0001 instead.
    writer.enqueue(vec![2u8; 10]).await.unwrap();
    writer.flush().await.unwrap();
    assert_eq!(core.file_state(0), Some(DataFileState::Sealed));
    assert_eq!(core.file_state(1), Some(DataFileState::Active));

    let mut reader = core.open_session();
    assert_eq!(reader.dequeue().await.unwrap(), Some(vec![1u8; 10]));
    assert_eq!(reader.dequeue().await.unwrap(), Some(vec![2u8; 10]));
    assert_eq!(reader.dequeue().await.unwrap(), None);
    reader.flush().await.unwrap();

    core.dispose().await;
}

#[tokio::test]
async fn writer_rolls_data_files_after_reload() {
    let dir = tempdir().unwrap();
    {
        let options = QueueOptions::from_path(dir.path())
            .max_file_size(16)
            .build()
            .unwrap();
        let core = QueueCore::open(options).await.unwrap();

        let mut writer = core.open_session();
        writer.enqueue(vec![1u8; 10]).await.unwrap();
        writer.flush().await.unwrap();
        writer.enqueue(vec![2u8; 10]).await.unwrap();
        writer.flush().await.unwrap();

        core.dispose().await;
    }

    let options = QueueOptions::from_path(dir.path())
        .max_file_size(16)
        .build()
        .unwrap();
    let core = QueueCore::open(options).await.unwrap();
    assert_eq!(core.file_state(0), Some(DataFileState::Sealed));
    assert_eq!(core.file_state(1), Some(DataFileState::Active));

    let mut reader = core.open_session();
    assert_eq!(reader.dequeue().await.unwrap(), Some(vec![1u8; 10]));
    assert_eq!(reader.dequeue().await.unwrap(), Some(vec![2u8; 10]));
    reader.flush().await.unwrap();

    core.dispose().await;
}
