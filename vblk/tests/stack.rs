//! End-to-end tests over assembled filter chains.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use vblk::filter::blocksize::{BlocksizeConfig, BlocksizeFilter};
use vblk::filter::cache::{CacheConfig, CacheFilter, CacheMode};
use vblk::filter::cow::{CowConfig, CowFilter};
use vblk::filter::protect::{ProtectFilter, parse_protect};
use vblk::filter::readahead::ReadaheadFilter;
use vblk::filter::truncate::{TruncateConfig, TruncateFilter};
use vblk::plugin::data::{DataConfig, DataPlugin};
use vblk::plugin::memory::MemoryPlugin;
use vblk::plugin::sparse_random::{SparseRandomConfig, SparseRandomPlugin};
use vblk::{Backend, Error, Flags};

/// The boot-sector expression of the data plugin served through the
/// block-size adapter: contents survive the filter stack unchanged.
#[test]
fn boot_sector_through_blocksize_adapter() {
    let expr = "@0x1b8 0xf8 0x21 0xdc 0xeb 0*4 2 0 0x83 0x20*2 0 1 0 0 0 0xff 0x7 \
                @0x1fe 0x55 0xaa";
    let mut config = DataConfig::expression(expr);
    config.size = Some(1_048_576);
    let data = Arc::new(DataPlugin::new(&config).unwrap());
    let chain =
        BlocksizeFilter::new(data, &BlocksizeConfig { minblock: 4096, maxdata: 0, maxlen: 0 })
            .unwrap();

    // An unaligned read straight across the interesting bytes.
    let mut buf = vec![0u8; 0x200 - 0x1b8];
    chain.pread(&mut buf, 0x1b8, Flags::NONE).unwrap();
    assert_eq!(
        &buf[..20],
        &[
            0xf8, 0x21, 0xdc, 0xeb, 0x00, 0x00, 0x00, 0x00, 0x02, 0x00, 0x83, 0x20, 0x20, 0x00,
            0x01, 0x00, 0x00, 0x00, 0xff, 0x07
        ]
    );
    assert_eq!(&buf[0x1fe - 0x1b8..], &[0x55, 0xaa]);
    assert!(buf[20..0x1fe - 0x1b8].iter().all(|&b| b == 0));
}

/// A three-layer chain: writes pass the cow overlay into a writeback
/// cache and only reach the plugin on flush.
#[test]
fn cow_over_cache_over_memory() {
    let memory = Arc::new(MemoryPlugin::new("sparse", 1 << 20).unwrap());
    let cache = Arc::new(
        CacheFilter::new(
            Arc::clone(&memory) as Arc<dyn Backend>,
            &CacheConfig {
                mode: CacheMode::Writeback,
                min_block_size: 4096,
                ..CacheConfig::default()
            },
        )
        .unwrap(),
    );
    let cow = CowFilter::new(Arc::clone(&cache) as Arc<dyn Backend>, &CowConfig::default())
        .unwrap();
    cow.prepare(false).unwrap();

    let data = vec![0xA7u8; 200_000];
    cow.pwrite(&data, 54321, Flags::NONE).unwrap();
    let mut back = vec![0u8; data.len()];
    cow.pread(&mut back, 54321, Flags::NONE).unwrap();
    assert_eq!(back, data);

    // The write stayed in the overlay: neither cache nor plugin saw it.
    let mut plugin_view = vec![0u8; 4096];
    memory.pread(&mut plugin_view, 54321, Flags::NONE).unwrap();
    assert!(plugin_view.iter().all(|&b| b == 0));
}

/// Invariant: a block written through the cow filter reads back
/// identically on the same instance, including after a chain flush.
#[test]
fn cow_read_back_after_flush() {
    let memory = Arc::new(MemoryPlugin::new("sparse", 1 << 20).unwrap());
    let cow = Arc::new(CowFilter::new(memory, &CowConfig::default()).unwrap());
    cow.prepare(false).unwrap();

    cow.pwrite(&[0xEE; 65536], 0, Flags::NONE).unwrap();
    cow.flush(Flags::NONE).unwrap();

    // A second "connection" is a second reference to the shared chain.
    let other = Arc::clone(&cow);
    let mut buf = vec![0u8; 65536];
    other.pread(&mut buf, 0, Flags::NONE).unwrap();
    assert!(buf.iter().all(|&b| b == 0xEE));
}

/// The protect filter guards ranges through a larger chain, and the
/// failure leaves the backing state untouched.
#[test]
fn protect_inside_a_chain() {
    let memory = Arc::new(MemoryPlugin::new("sparse", 1 << 20).unwrap());
    memory.pwrite(&[0xCD; 4096], 0, Flags::NONE).unwrap();
    let protect = Arc::new(
        ProtectFilter::new(
            Arc::clone(&memory) as Arc<dyn Backend>,
            &parse_protect("100-199").unwrap(),
        )
        .unwrap(),
    );
    let chain = BlocksizeFilter::new(
        Arc::clone(&protect) as Arc<dyn Backend>,
        &BlocksizeConfig::default(),
    )
    .unwrap();

    // Writing matching bytes over the protected range is fine.
    chain.pwrite(&[0xCD; 50], 80, Flags::NONE).unwrap();

    // Mismatched bytes fail with permission denied...
    let err = protect.pwrite(&[0xAA; 50], 150, Flags::NONE).unwrap_err();
    assert!(matches!(err, Error::PermissionDenied(_)));
    // ...and the backend is unchanged.
    let mut buf = [0u8; 50];
    memory.pread(&mut buf, 150, Flags::NONE).unwrap();
    assert_eq!(buf, [0xCD; 50]);
}

/// Truncate over cow: the displayed size grows, the tail reads zero
/// and rejects non-zero writes, while real bytes stay writable.
#[test]
fn truncate_over_cow() {
    let memory = Arc::new(MemoryPlugin::new("sparse", 100_000).unwrap());
    let cow = Arc::new(CowFilter::new(memory, &CowConfig::default()).unwrap());
    let chain = TruncateFilter::new(
        cow,
        &TruncateConfig { round_up: Some(65536), ..TruncateConfig::default() },
    )
    .unwrap();
    chain.prepare(false).unwrap();

    assert_eq!(chain.get_size().unwrap(), 131_072);
    chain.pwrite(&[5u8; 1000], 99_000, Flags::NONE).unwrap();
    let err = chain.pwrite(&[5u8; 10], 120_000, Flags::NONE).unwrap_err();
    assert!(matches!(err, Error::NoSpace(_)));

    let mut buf = vec![0xFFu8; 31_072];
    chain.pread(&mut buf, 100_000, Flags::NONE).unwrap();
    assert!(buf.iter().all(|&b| b == 0));
}

/// The readahead worker drives cache requests into the cache filter,
/// which serves them from its scratch file afterwards.
#[test]
fn readahead_over_cache() {
    let memory = Arc::new(MemoryPlugin::new("sparse", 4 << 20).unwrap());
    memory.pwrite(&vec![9u8; 4 << 20], 0, Flags::NONE).unwrap();
    let cache = Arc::new(
        CacheFilter::new(
            Arc::clone(&memory) as Arc<dyn Backend>,
            &CacheConfig { min_block_size: 4096, ..CacheConfig::default() },
        )
        .unwrap(),
    );
    cache.prepare(false).unwrap();
    let ra = ReadaheadFilter::new(Arc::clone(&cache) as Arc<dyn Backend>).unwrap();

    let mut buf = vec![0u8; 65536];
    let mut offset = 0;
    while offset < (1 << 20) {
        ra.pread(&mut buf, offset, Flags::NONE).unwrap();
        assert!(buf.iter().all(|&b| b == 9), "offset {offset}");
        offset += buf.len() as u64;
    }
    drop(ra);
}

/// Copy fidelity: reading one sparse-random instance and writing the
/// bytes into an identically-configured one must verify cleanly.
#[test]
fn sparse_random_copy_fidelity() {
    let config = SparseRandomConfig { size: 2 << 20, seed: 1234, ..SparseRandomConfig::default() };
    let source = SparseRandomPlugin::new(&config).unwrap();
    let target = SparseRandomPlugin::new(&config).unwrap();

    let mut buf = vec![0u8; 256 * 1024];
    let mut offset = 0;
    while offset < 2 << 20 {
        source.pread(&mut buf, offset, Flags::NONE).unwrap();
        target.pwrite(&buf, offset, Flags::NONE).unwrap();
        offset += buf.len() as u64;
    }

    // A corrupted copy is caught.
    source.pread(&mut buf, 0, Flags::NONE).unwrap();
    buf[777] ^= 1;
    assert!(target.pwrite(&buf, 0, Flags::NONE).is_err());
}

/// Writethrough cache sitting under a cow filter still pushes every
/// overlay-missing read to the plugin exactly once per block run.
#[test]
fn full_chain_capabilities_are_coherent() {
    let memory = Arc::new(MemoryPlugin::new("sparse", 1 << 20).unwrap());
    let cache = Arc::new(
        CacheFilter::new(
            Arc::clone(&memory) as Arc<dyn Backend>,
            &CacheConfig { min_block_size: 4096, ..CacheConfig::default() },
        )
        .unwrap(),
    );
    let cow = CowFilter::new(Arc::clone(&cache) as Arc<dyn Backend>, &CowConfig::default())
        .unwrap();
    cow.prepare(false).unwrap();

    // The filters advertise their own capabilities, not the plugin's.
    assert!(cow.can_write().unwrap());
    assert!(cow.can_trim().unwrap());
    assert_eq!(cow.get_size().unwrap(), 1 << 20);
    assert!(cow.can_multi_conn().unwrap());
}
