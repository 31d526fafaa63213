//! # Journal Recovery Tests
//!
//! Crash-cycle tests for the journal: write, close, reopen, recover, and
//! check that exactly the checkpointed state comes back.
//!
//! Scenarios covered:
//! 1. A clean write/checkpoint/close cycle recovers every page
//! 2. A torn record at the tail marks the journal dirty without losing the
//!    checkpointed state before it
//! 3. Pages journalled without a covering checkpoint are discarded
//! 4. Transient page images never survive recovery
//! 5. Recovery is a once-per-instance operation
//! 6. Closing with a drained page index deletes every segment file

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::sync::Arc;

use tempfile::tempdir;

use burrow_journal::journal::{list_segment_files, PA_OVERHEAD, REC_PA};
use burrow_journal::volume::{Volume, VolumeRegistry};
use burrow_journal::{Checkpoint, Journal, JournalConfig, JournalError, PageImage};

const PAGE_SIZE: usize = 256;

fn write_page(journal: &Journal, volume: &Volume, page: u64, timestamp: i64, fill: u8) {
    let bytes = vec![fill; volume.page_size()];
    journal
        .write_page_to_journal(&PageImage {
            volume,
            page_address: page,
            timestamp,
            transient: false,
            bytes: &bytes,
            left_size: 0,
            right_size: 0,
        })
        .unwrap();
}

#[test]
fn clean_cycle_recovers_checkpointed_pages() {
    let dir = tempdir().unwrap();
    let journal_dir = dir.path().join("journal");
    let volumes = Arc::new(VolumeRegistry::new());
    let volume = Volume::create(dir.path().join("a.vol"), 1, PAGE_SIZE).unwrap();
    volumes.register(volume.clone());

    {
        let journal = Journal::open(JournalConfig::new(&journal_dir), volumes.clone()).unwrap();
        journal.recover().unwrap();
        for page in 1..=3u64 {
            write_page(&journal, &volume, page, page as i64, page as u8);
        }
        journal
            .write_checkpoint_to_journal(Checkpoint::new(10, 1_000))
            .unwrap();
        journal.close().unwrap();
    }

    let journal = Journal::open(JournalConfig::new(&journal_dir), volumes).unwrap();
    journal.recover().unwrap();

    assert_eq!(journal.page_index_size(), 3);
    assert_eq!(journal.last_valid_checkpoint().timestamp, 10);
    assert_eq!(journal.first_generation(), 0);
    assert_eq!(journal.current_generation(), 0);
    assert!(journal.dirty_recovery_file_address().is_none());

    let mut buf = Vec::new();
    for page in 1..=3u64 {
        assert!(journal
            .read_page_from_journal(&volume, page, &mut buf)
            .unwrap());
        assert_eq!(buf, vec![page as u8; PAGE_SIZE]);
    }
    journal.close().unwrap();
}

#[test]
fn torn_tail_marks_journal_dirty_but_keeps_checkpointed_state() {
    let dir = tempdir().unwrap();
    let journal_dir = dir.path().join("journal");
    let volumes = Arc::new(VolumeRegistry::new());
    let volume = Volume::create(dir.path().join("a.vol"), 1, PAGE_SIZE).unwrap();
    volumes.register(volume.clone());

    {
        let journal = Journal::open(JournalConfig::new(&journal_dir), volumes.clone()).unwrap();
        journal.recover().unwrap();
        for page in 1..=3u64 {
            write_page(&journal, &volume, page, page as i64, page as u8);
        }
        journal
            .write_checkpoint_to_journal(Checkpoint::new(10, 1_000))
            .unwrap();
        journal.close().unwrap();
    }

    // Simulate a crash mid-append: a PA header whose body never made it.
    let segment = list_segment_files(&journal_dir).unwrap()[0].clone();
    let torn_offset = fs::metadata(&segment).unwrap().len();
    {
        let mut file = OpenOptions::new().append(true).open(&segment).unwrap();
        let mut torn = Vec::new();
        torn.push(REC_PA);
        torn.extend_from_slice(&((PA_OVERHEAD + PAGE_SIZE) as u32).to_le_bytes());
        torn.extend_from_slice(&11i64.to_le_bytes());
        torn.extend_from_slice(&[0u8; 8]);
        file.write_all(&torn).unwrap();
        file.sync_all().unwrap();
    }

    let journal = Journal::open(JournalConfig::new(&journal_dir), volumes).unwrap();
    journal.recover().unwrap();

    assert_eq!(journal.page_index_size(), 3);
    assert_eq!(journal.last_valid_checkpoint().timestamp, 10);

    let dirty = journal
        .dirty_recovery_file_address()
        .expect("a torn tail SHOULD leave a dirty recovery address");
    assert_eq!(dirty.file(), segment.as_path());
    assert_eq!(dirty.offset(), torn_offset);
    journal.close().unwrap();
}

#[test]
fn pages_without_a_covering_checkpoint_are_discarded() {
    let dir = tempdir().unwrap();
    let journal_dir = dir.path().join("journal");
    let volumes = Arc::new(VolumeRegistry::new());
    let volume = Volume::create(dir.path().join("a.vol"), 1, PAGE_SIZE).unwrap();
    volumes.register(volume.clone());

    {
        let journal = Journal::open(JournalConfig::new(&journal_dir), volumes.clone()).unwrap();
        journal.recover().unwrap();
        for page in 1..=5u64 {
            write_page(&journal, &volume, page, page as i64, 0xEE);
        }
        journal.close().unwrap();
    }

    let journal = Journal::open(JournalConfig::new(&journal_dir), volumes).unwrap();
    journal.recover().unwrap();

    assert_eq!(
        journal.page_index_size(),
        0,
        "pages after the last checkpoint SHOULD NOT survive recovery"
    );
    journal.close().unwrap();
}

#[test]
fn transient_pages_do_not_survive_recovery() {
    let dir = tempdir().unwrap();
    let journal_dir = dir.path().join("journal");
    let volumes = Arc::new(VolumeRegistry::new());
    let volume = Volume::create(dir.path().join("a.vol"), 1, PAGE_SIZE).unwrap();
    volumes.register(volume.clone());

    {
        let journal = Journal::open(JournalConfig::new(&journal_dir), volumes.clone()).unwrap();
        journal.recover().unwrap();
        let bytes = vec![0xAB; PAGE_SIZE];
        journal
            .write_page_to_journal(&PageImage {
                volume: &volume,
                page_address: 7,
                timestamp: 5,
                transient: true,
                bytes: &bytes,
                left_size: 0,
                right_size: 0,
            })
            .unwrap();
        journal
            .write_checkpoint_to_journal(Checkpoint::new(6, 1_000))
            .unwrap();
        journal.close().unwrap();
    }

    let journal = Journal::open(JournalConfig::new(&journal_dir), volumes).unwrap();
    journal.recover().unwrap();

    assert_eq!(journal.page_index_size(), 0);
    let mut buf = Vec::new();
    assert!(!journal
        .read_page_from_journal(&volume, 7, &mut buf)
        .unwrap());
    journal.close().unwrap();
}

#[test]
fn recovering_twice_is_an_illegal_state() {
    let dir = tempdir().unwrap();
    let journal = Journal::open(
        JournalConfig::new(dir.path().join("journal")),
        Arc::new(VolumeRegistry::new()),
    )
    .unwrap();
    journal.recover().unwrap();

    let report = journal.recover().unwrap_err();
    assert!(
        matches!(
            report.downcast_ref::<JournalError>(),
            Some(JournalError::IllegalState(_))
        ),
        "second recover() SHOULD fail with IllegalState, got {:#}",
        report
    );
    journal.close().unwrap();
}

#[test]
fn operations_before_recovery_are_illegal() {
    let dir = tempdir().unwrap();
    let volume = Volume::create(dir.path().join("a.vol"), 1, PAGE_SIZE).unwrap();
    let journal = Journal::open(
        JournalConfig::new(dir.path().join("journal")),
        Arc::new(VolumeRegistry::new()),
    )
    .unwrap();

    let bytes = vec![0u8; PAGE_SIZE];
    let report = journal
        .write_page_to_journal(&PageImage {
            volume: &volume,
            page_address: 1,
            timestamp: 1,
            transient: false,
            bytes: &bytes,
            left_size: 0,
            right_size: 0,
        })
        .unwrap_err();
    assert!(matches!(
        report.downcast_ref::<JournalError>(),
        Some(JournalError::IllegalState(_))
    ));

    // A checkpoint before recovery is a silent no-op, not an error.
    journal
        .write_checkpoint_to_journal(Checkpoint::new(1, 1))
        .unwrap();
    journal.close().unwrap();
}

#[test]
fn close_with_a_drained_index_deletes_all_segments() {
    let dir = tempdir().unwrap();
    let journal_dir = dir.path().join("journal");
    let journal = Journal::open(
        JournalConfig::new(&journal_dir),
        Arc::new(VolumeRegistry::new()),
    )
    .unwrap();
    journal.recover().unwrap();

    // Creates a segment holding only the checkpoint record.
    journal
        .write_checkpoint_to_journal(Checkpoint::new(1, 1_000))
        .unwrap();
    assert_eq!(list_segment_files(&journal_dir).unwrap().len(), 1);

    journal.close().unwrap();
    assert!(
        list_segment_files(&journal_dir).unwrap().is_empty(),
        "an empty page index SHOULD let close() delete every segment"
    );
}

#[test]
fn absent_pages_read_false_without_touching_segments() {
    let dir = tempdir().unwrap();
    let journal_dir = dir.path().join("journal");
    let volumes = Arc::new(VolumeRegistry::new());
    let volume = Volume::create(dir.path().join("a.vol"), 1, PAGE_SIZE).unwrap();
    volumes.register(volume.clone());

    let journal = Journal::open(JournalConfig::new(&journal_dir), volumes).unwrap();
    journal.recover().unwrap();

    let mut buf = Vec::new();
    assert!(!journal
        .read_page_from_journal(&volume, 99, &mut buf)
        .unwrap());
    assert!(
        list_segment_files(&journal_dir).unwrap().is_empty(),
        "a miss SHOULD NOT create or open any segment file"
    );
    journal.close().unwrap();
}

#[test]
fn split_page_images_reassemble_on_read() {
    let dir = tempdir().unwrap();
    let volumes = Arc::new(VolumeRegistry::new());
    let volume = Volume::create(dir.path().join("a.vol"), 1, PAGE_SIZE).unwrap();
    volumes.register(volume.clone());

    let journal = Journal::open(JournalConfig::new(dir.path().join("journal")), volumes).unwrap();
    journal.recover().unwrap();

    // Live head and tail with a zeroed gap in the middle, as a B-Tree page
    // buffer presents it.
    let mut bytes = vec![0u8; PAGE_SIZE];
    for (i, byte) in bytes.iter_mut().take(40).enumerate() {
        *byte = i as u8 + 1;
    }
    for (i, byte) in bytes.iter_mut().rev().take(60).enumerate() {
        *byte = 0xC0 | (i as u8 & 0x0F);
    }
    journal
        .write_page_to_journal(&PageImage {
            volume: &volume,
            page_address: 4,
            timestamp: 9,
            transient: false,
            bytes: &bytes,
            left_size: 40,
            right_size: 60,
        })
        .unwrap();

    let mut read = Vec::new();
    assert!(journal
        .read_page_from_journal(&volume, 4, &mut read)
        .unwrap());
    assert_eq!(read, bytes, "gap elision SHOULD be lossless for zero gaps");
    journal.close().unwrap();
}
