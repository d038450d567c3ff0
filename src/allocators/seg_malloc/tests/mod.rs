use crate::freelist::{bucket_for, FREELIST_COUNT, NIL};
use crate::growers::{MmapGrower, VecGrower};
use crate::header::{hdrp, SENTINEL};

use self::format::{RecordEntryLayer, SimpleFormatter};

use super::check::Violation;
use super::*;

use tracing_subscriber::fmt::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};


/// Offset of the first block payload in a heap grown from an empty grower.
const FIRST: usize = TABLE_SIZE + DSIZE;
/// Heap size right after `init` with the default chunk.
const INIT_SIZE: usize = FIRST + 4096;

fn strict(limit: usize) -> SegMalloc<VecGrower> {
    SegMalloc::with_config(
        VecGrower::new(limit),
        Config::new().check(CheckMode::Strict),
    )
}

fn fill(allocator: &mut SegMalloc<VecGrower>, ptr: BlockPtr, len: usize, seed: u8) {
    for (i, byte) in allocator.payload_mut(ptr)[..len].iter_mut().enumerate() {
        *byte = seed.wrapping_add(i as u8);
    }
}

fn is_filled(allocator: &SegMalloc<VecGrower>, ptr: BlockPtr, len: usize, seed: u8) -> bool {
    allocator.payload(ptr)[..len]
        .iter()
        .enumerate()
        .all(|(i, &byte)| byte == seed.wrapping_add(i as u8))
}

#[test]
fn test_init_layout() {
    let mut allocator = strict(1 << 20);
    assert!(!allocator.is_initialized());
    assert_eq!(allocator.hi(), None);
    allocator.init().unwrap();
    allocator.init().unwrap();

    assert_eq!(allocator.lo(), 0);
    assert_eq!(allocator.hi(), Some(INIT_SIZE - 1));
    assert_eq!(allocator.epilogue, INIT_SIZE);

    let heap = &allocator.heap;
    assert_eq!(heap.get_word(TABLE_SIZE), SENTINEL.bits());
    assert_eq!(heap.header(FIRST), Header::new(4096, true, false));
    assert_eq!(heap.footer(FIRST), heap.header(FIRST));
    assert_eq!(heap.header(INIT_SIZE), Header::new(0, false, true));

    for index in 0..FREELIST_COUNT - 1 {
        assert!(allocator.lists.iter(heap, index).next().is_none());
    }
    assert_eq!(
        allocator.lists.iter(heap, FREELIST_COUNT - 1).collect::<Vec<_>>(),
        [FIRST]
    );

    let report = allocator.check_heap();
    assert!(report.is_ok());
    assert_eq!(report.blocks, 1);
    assert_eq!(report.free_bytes, 4096);
}

#[test]
fn test_lazy_init() {
    let mut allocator = strict(1 << 20);
    let p = allocator.allocate(1).unwrap();
    assert!(allocator.is_initialized());
    assert_eq!(p.offset(), FIRST);
}

#[test]
fn test_zero_size() {
    let mut allocator = strict(1 << 20);
    assert!(allocator.allocate(0).is_none());
    assert!(allocator.calloc(0, 8).is_none());
    allocator.deallocate(None);
    assert!(allocator.reallocate(None, 0).is_none());
    assert!(allocator.check_heap().is_ok());
}

#[test]
fn test_alignment_and_capacity() {
    let mut allocator = strict(1 << 20);
    let mut objects = vec![];
    for size in 1..300 {
        let p = allocator.allocate(size).unwrap();
        assert_eq!(p.offset() % DSIZE, 0);
        assert!(allocator.usable_size(p) >= size);
        fill(&mut allocator, p, size, size as u8);
        objects.push((p, size));
    }
    for &(p, size) in &objects {
        assert!(is_filled(&allocator, p, size, size as u8));
    }
    for (i, &(p, size)) in objects.iter().enumerate() {
        if let Some(&(next, _)) = objects.get(i + 1) {
            assert!(p.offset() + size <= next.offset());
        }
    }
}

#[test]
fn test_split_and_flags() {
    let mut allocator = strict(1 << 20);
    let p = allocator.allocate(16).unwrap();
    let heap = &allocator.heap;
    assert_eq!(heap.header(p.offset()), Header::new(24, true, true));
    let rest = heap.next_block(p.offset());
    assert_eq!(heap.header(rest), Header::new(4096 - 24, true, false));
    assert_eq!(allocator.usable_size(p), 20);
}

#[test]
fn test_consume_whole_block() {
    let mut allocator = strict(1 << 20);
    // Leaves exactly 8 bytes behind, too few for a block of their own.
    let p = allocator.allocate(4096 - 8 - WSIZE).unwrap();
    let heap = &allocator.heap;
    assert_eq!(heap.header(p.offset()), Header::new(4096, true, true));
    assert!(heap.header(INIT_SIZE).is_prev_alloc());
    assert_eq!(allocator.check_heap().free_blocks, 0);
}

#[test]
fn test_reuse_freed_middle_block() {
    let mut allocator = strict(1 << 20);
    let p1 = allocator.allocate(16).unwrap();
    let p2 = allocator.allocate(32).unwrap();
    let p3 = allocator.allocate(64).unwrap();
    assert!(p1 < p2 && p2 < p3);
    let hi = allocator.hi();

    allocator.deallocate(p2);
    let p4 = allocator.allocate(20).unwrap();
    assert_eq!(p4, p2);
    assert_eq!(allocator.hi(), hi);
}

#[test]
fn test_free_reverse_order() {
    let mut allocator = strict(1 << 20);
    let p1 = allocator.allocate(100).unwrap();
    let p2 = allocator.allocate(100).unwrap();
    allocator.deallocate(p2);
    allocator.deallocate(p1);

    let report = allocator.check_heap();
    assert!(report.is_ok(), "{report}");
    assert_eq!(report.free_blocks, 1);
    assert_eq!(report.free_bytes, 4096);
}

#[test]
fn test_coalesce_either_order() {
    for reverse in [false, true] {
        let mut allocator = strict(1 << 20);
        let p1 = allocator.allocate(40).unwrap();
        let p2 = allocator.allocate(40).unwrap();
        let _guard = allocator.allocate(40).unwrap();

        match reverse {
            false => {
                allocator.deallocate(p1);
                allocator.deallocate(p2);
            }
            true => {
                allocator.deallocate(p2);
                allocator.deallocate(p1);
            }
        }

        let header = allocator.heap.header(p1.offset());
        assert_eq!(header, Header::new(96, true, false));
        assert_eq!(
            allocator.lists.iter(&allocator.heap, bucket_for(96)).collect::<Vec<_>>(),
            [p1.offset()]
        );
        assert_eq!(allocator.check_heap().free_blocks, 2);
    }
}

#[test]
fn test_coalesce_both_sides() {
    let mut allocator = strict(1 << 20);
    let p1 = allocator.allocate(40).unwrap();
    let p2 = allocator.allocate(40).unwrap();
    let p3 = allocator.allocate(40).unwrap();
    let _guard = allocator.allocate(40).unwrap();

    allocator.deallocate(p1);
    allocator.deallocate(p3);
    assert_eq!(allocator.check_heap().free_blocks, 3);
    allocator.deallocate(p2);

    assert_eq!(allocator.heap.header(p1.offset()), Header::new(144, true, false));
    assert_eq!(allocator.check_heap().free_blocks, 2);
}

#[test]
fn test_alloc_free_loop_keeps_heap_size() {
    let mut allocator = strict(1 << 20);
    let p = allocator.allocate(100).unwrap();
    let hi = allocator.hi();
    allocator.deallocate(p);

    for _ in 0..1000 {
        let q = allocator.allocate(100).unwrap();
        assert_eq!(q, p);
        assert_eq!(allocator.hi(), hi);
        allocator.deallocate(q);
    }
}

#[test]
fn test_extension_merges_with_free_tail() {
    let mut allocator = strict(1 << 20);
    let p = allocator.allocate(8000).unwrap();
    // The 4096 byte chunk was free and sat right before the new space.
    assert_eq!(p.offset(), FIRST);
    assert_eq!(allocator.hi(), Some(INIT_SIZE + 8008 - 1));
    assert_eq!(allocator.check_heap().free_bytes, 4096);
}

#[test]
fn test_exhaustion() {
    let mut allocator = strict(INIT_SIZE);
    let p = allocator.allocate(16).unwrap();
    let hi = allocator.hi();

    assert!(allocator.allocate(5000).is_none());
    assert_eq!(allocator.hi(), hi);
    assert!(allocator.check_heap().is_ok());

    // The rest of the heap is still usable.
    assert!(allocator.allocate(16).is_some());
    allocator.deallocate(p);
}

#[test]
fn test_init_failure() {
    let mut allocator = strict(FIRST - 1);
    assert_eq!(allocator.init(), Err(AllocError::Exhausted));
    assert!(!allocator.is_initialized());
    assert!(allocator.allocate(8).is_none());
    assert!(allocator.check_heap().is_ok());
}

#[test]
fn test_first_chunk_failure_leaves_usable_heap() {
    let config = Config::new().chunk_size(64).check(CheckMode::Strict);
    let mut allocator = SegMalloc::with_config(VecGrower::new(FIRST + 32), config);
    assert_eq!(allocator.init(), Err(AllocError::Exhausted));
    assert!(allocator.is_initialized());
    assert_eq!(allocator.epilogue, FIRST);
    assert!(allocator.check_heap().is_ok());

    // Extensions are at least one chunk, so even a small request fails.
    assert!(allocator.allocate(8).is_none());

    let mut allocator = SegMalloc::with_config(VecGrower::new(FIRST + 64), config.chunk_size(16));
    assert!(allocator.init().is_ok());
    assert!(allocator.allocate(40).is_some());
}

#[test]
fn test_oversized() {
    let mut allocator = strict(1 << 20);
    assert!(allocator.allocate(usize::MAX).is_none());
    assert!(allocator.allocate(MAX_BLOCK_SIZE).is_none());
    assert!(allocator.calloc(usize::MAX, 2).is_none());
    assert!(allocator.check_heap().is_ok());
}

#[test]
fn test_realloc_null_and_zero() {
    let mut allocator = strict(1 << 20);
    let p = allocator.reallocate(None, 24).unwrap();
    assert_eq!(p.offset(), FIRST);
    assert!(allocator.reallocate(p, 0).is_none());

    let report = allocator.check_heap();
    assert_eq!(report.free_blocks, 1);
    assert_eq!(report.free_bytes, 4096);
}

#[test]
fn test_realloc_moves_and_copies() {
    let config = Config::new().check(CheckMode::Strict).realloc_in_place(false);
    let mut allocator = SegMalloc::with_config(VecGrower::new(1 << 20), config);
    let p = allocator.allocate(50).unwrap();
    fill(&mut allocator, p, 50, 7);

    let q = allocator.reallocate(p, 500).unwrap();
    assert_ne!(p, q);
    assert!(is_filled(&allocator, q, 50, 7));

    // Shrinking copies only what fits.
    let r = allocator.reallocate(q, 10).unwrap();
    assert_ne!(q, r);
    assert!(is_filled(&allocator, r, 10, 7));
}

#[test]
fn test_realloc_shrinks_in_place() {
    let mut allocator = strict(1 << 20);
    let p = allocator.allocate(200).unwrap();
    let guard = allocator.allocate(16).unwrap();
    fill(&mut allocator, p, 200, 3);

    let q = allocator.reallocate(p, 20).unwrap();
    assert_eq!(p, q);
    assert_eq!(allocator.usable_size(q), 20);
    assert!(is_filled(&allocator, q, 20, 3));

    // The tail is free and sits between `q` and `guard`.
    let tail = allocator.heap.next_block(q.offset());
    assert!(!allocator.heap.header(tail).is_alloc());
    assert_eq!(allocator.heap.next_block(tail), guard.offset());
    assert!(!allocator.heap.header(guard.offset()).is_prev_alloc());
}

#[test]
fn test_realloc_grows_into_free_successor() {
    let mut allocator = strict(1 << 20);
    let p = allocator.allocate(24).unwrap();
    let q = allocator.allocate(100).unwrap();
    fill(&mut allocator, p, 24, 11);
    allocator.deallocate(q);

    let r = allocator.reallocate(p, 1000).unwrap();
    assert_eq!(p, r);
    assert!(allocator.usable_size(r) >= 1000);
    assert!(is_filled(&allocator, r, 24, 11));
}

#[test]
fn test_realloc_failure_leaves_block() {
    let mut allocator = strict(INIT_SIZE);
    let p = allocator.allocate(16).unwrap();
    let _guard = allocator.allocate(16).unwrap();
    fill(&mut allocator, p, 16, 42);

    assert!(allocator.reallocate(p, 10_000).is_none());
    assert!(allocator.reallocate(p, usize::MAX).is_none());
    assert!(is_filled(&allocator, p, 16, 42));
    assert!(allocator.heap.header(p.offset()).is_alloc());
    assert!(allocator.check_heap().is_ok());
}

#[test]
fn test_calloc_zeroes_reused_memory() {
    let mut allocator = strict(1 << 20);
    let p = allocator.allocate(64).unwrap();
    allocator.payload_mut(p).fill(0xff);
    allocator.deallocate(p);

    let q = allocator.calloc(8, 8).unwrap();
    assert_eq!(p, q);
    assert!(allocator.payload(q).iter().all(|&b| b == 0));
}

#[test]
fn test_invalid_free_is_ignored() {
    let mut allocator = strict(1 << 20);
    let p = allocator.allocate(32).unwrap();
    let _guard = allocator.allocate(32).unwrap();
    allocator.deallocate(p);
    allocator.deallocate(p);

    let bogus = BlockPtr::new(FIRST + 4).unwrap();
    allocator.deallocate(bogus);
    assert!(allocator.reallocate(bogus, 8).is_none());
    assert!(allocator.check_heap().is_ok());
}

#[test]
fn test_check_detects_unlisted_free_block() {
    let mut allocator = SegMalloc::with_grower(VecGrower::new(1 << 20));
    let p1 = allocator.allocate(32).unwrap();
    let p2 = allocator.allocate(32).unwrap();

    let size = allocator.heap.header(p1.offset()).size();
    allocator
        .heap
        .set_header(p1.offset(), Header::new(size, true, false));

    let report = allocator.check_heap();
    assert!(!report.is_ok());
    assert!(report
        .violations
        .contains(&Violation::PrevAllocMismatch { block: p2.offset() }));
    assert!(report.violations.iter().any(|v| matches!(
        v,
        Violation::TagMismatch { block, .. } if *block == p1.offset()
    )));
    assert!(report
        .violations
        .contains(&Violation::FreeCountMismatch { heap: 2, lists: 1 }));
}

#[test]
fn test_check_detects_uncoalesced_blocks() {
    let mut allocator = SegMalloc::with_grower(VecGrower::new(1 << 20));
    let p1 = allocator.allocate(32).unwrap();
    let p2 = allocator.allocate(32).unwrap();
    let _guard = allocator.allocate(32).unwrap();

    // Free both blocks by hand, skipping coalescing.
    for p in [p1, p2] {
        let size = allocator.heap.header(p.offset()).size();
        let free = Header::new(size, p == p1, false);
        allocator.heap.set_boundary_tags(p.offset(), free);
        allocator.lists.insert(&mut allocator.heap, p.offset());
    }
    let next = allocator.heap.next_block(p2.offset());
    allocator.heap.set_prev_alloc(next, false);

    let report = allocator.check_heap();
    assert_eq!(
        report.violations,
        [Violation::Uncoalesced {
            block: p1.offset(),
            next: p2.offset()
        }]
    );
}

#[test]
fn test_check_detects_list_corruption() {
    let mut allocator = SegMalloc::with_grower(VecGrower::new(1 << 20));
    allocator.init().unwrap();

    // A self-referencing free block.
    allocator.heap.set_link(FIRST, FIRST);
    let report = allocator.check_heap();
    assert_eq!(
        report.violations,
        [Violation::Cycle {
            bucket: FREELIST_COUNT - 1
        }]
    );

    // A link past the end of the heap.
    allocator.heap.set_link(FIRST, 1 << 30);
    let report = allocator.check_heap();
    assert_eq!(
        report.violations,
        [Violation::BadLink {
            bucket: FREELIST_COUNT - 1,
            link: 1 << 30
        }]
    );

    // An allocated block left in a list.
    allocator.heap.set_link(FIRST, NIL);
    let p = allocator.allocate(32).unwrap();
    let head = allocator.lists.head_cell(bucket_for(40));
    allocator.heap.set_link(p.offset(), NIL);
    allocator.heap.set_link(head, p.offset());
    let report = allocator.check_heap();
    assert!(report.violations.contains(&Violation::AllocatedInList {
        bucket: bucket_for(40),
        block: p.offset()
    }));
}

#[test]
fn test_check_detects_wrong_bucket() {
    let mut allocator = SegMalloc::with_grower(VecGrower::new(1 << 20));
    allocator.init().unwrap();
    allocator.heap.set_link(allocator.lists.head_cell(FREELIST_COUNT - 1), NIL);
    allocator.heap.set_link(FIRST, NIL);
    allocator.heap.set_link(allocator.lists.head_cell(0), FIRST);

    let report = allocator.check_heap();
    assert_eq!(
        report.violations,
        [Violation::WrongBucket {
            bucket: 0,
            block: FIRST,
            size: 4096
        }]
    );
}

#[test]
fn test_check_detects_undersized_block() {
    let mut allocator = SegMalloc::with_grower(VecGrower::new(1 << 20));
    allocator.init().unwrap();
    allocator.heap.set_header(FIRST, Header::new(8, true, false));

    let report = allocator.check_heap();
    assert!(report.violations.contains(&Violation::Undersized {
        block: FIRST,
        size: 8
    }));
}

#[test]
fn test_check_detects_block_past_epilogue() {
    let mut allocator = SegMalloc::with_grower(VecGrower::new(1 << 20));
    allocator.init().unwrap();
    allocator.heap.set_header(FIRST, Header::new(2 * 4096, true, false));

    let report = allocator.check_heap();
    assert!(report
        .violations
        .contains(&Violation::OutOfHeap { block: FIRST }));
}

#[test]
fn test_check_detects_misaligned_size() {
    let mut allocator = SegMalloc::with_grower(VecGrower::new(1 << 20));
    allocator.init().unwrap();
    let bits = Header::new(4096, true, false).bits() | 0b100;
    allocator.heap.put_word(hdrp(FIRST), bits);

    let report = allocator.check_heap();
    assert!(report
        .violations
        .contains(&Violation::Misaligned { block: FIRST, bits }));
}

#[test]
fn test_heap_stays_within_block_size_limit() {
    let grower = MmapGrower::new(9 << 30).unwrap();
    let config = Config::new().check(CheckMode::Strict);
    let mut allocator = SegMalloc::with_config(grower, config);
    allocator.init().unwrap();

    // Merging with the free 4096 byte tail would overflow a header.
    assert_eq!(
        allocator.alloc_block(MAX_BLOCK_SIZE - WSIZE),
        Err(AllocError::Oversized)
    );
    assert!(allocator.allocate(MAX_BLOCK_SIZE - WSIZE).is_none());
    assert_eq!(allocator.hi(), Some(INIT_SIZE - 1));

    let report = allocator.check_heap();
    assert!(report.is_ok(), "{report}");
    assert_eq!(report.free_bytes, 4096);

    let p = allocator.allocate(1 << 20).unwrap();
    assert_eq!(p.offset(), FIRST);
}

#[test]
fn test_heap_after_foreign_bytes() {
    let mut grower = VecGrower::new(1 << 20);
    grower.grow(3).unwrap();
    let mut allocator = SegMalloc::with_config(grower, Config::new().check(CheckMode::Strict));
    assert_eq!(allocator.lo(), 3);

    let p = allocator.allocate(24).unwrap();
    assert_eq!(allocator.lo(), 3);
    assert_eq!(p.offset(), DSIZE + FIRST);
    assert_eq!(allocator.hi(), Some(DSIZE + INIT_SIZE - 1));

    allocator.deallocate(p);
    let report = allocator.check_heap();
    assert!(report.is_ok(), "{report}");
    assert_eq!(report.free_blocks, 1);
}

#[test]
fn test_check_detects_bad_sentinels() {
    let mut allocator = SegMalloc::with_grower(VecGrower::new(1 << 20));
    allocator.init().unwrap();
    allocator.heap.put_word(TABLE_SIZE, 0);
    allocator.heap.put_word(hdrp(INIT_SIZE), 0);

    let report = allocator.check_heap();
    assert!(report.violations.contains(&Violation::BadPrologue {
        at: TABLE_SIZE,
        bits: 0
    }));
    assert!(report.violations.contains(&Violation::BadEpilogue {
        epilogue: INIT_SIZE,
        heap_end: INIT_SIZE
    }));
}

#[test]
#[should_panic(expected = "Heap check failed")]
fn test_strict_mode_panics() {
    let mut allocator = strict(1 << 20);
    allocator.init().unwrap();
    // The last block is free, so the epilogue must not claim otherwise.
    allocator.heap.set_prev_alloc(INIT_SIZE, true);
    let _ = allocator.allocate(8);
}

#[test]
fn test_report_mode_keeps_going() {
    let config = Config::new().check(CheckMode::Report);
    let mut allocator = SegMalloc::with_config(VecGrower::new(1 << 20), config);
    allocator.init().unwrap();
    allocator.heap.set_prev_alloc(INIT_SIZE, true);
    assert!(allocator.allocate(8).is_some());
    assert!(!allocator.check_heap().is_ok());
}

#[test]
fn test_mmap_grower() {
    let grower = MmapGrower::new(1 << 24).unwrap();
    let config = Config::new().chunk_size(1 << 16).check(CheckMode::Strict);
    let mut allocator = SegMalloc::with_config(grower, config);

    let mut objects = vec![];
    for i in 1..64 {
        let p = allocator.allocate(i * 97).unwrap();
        allocator.payload_mut(p)[0] = i as u8;
        objects.push(p);
    }
    for (i, &p) in objects.iter().enumerate().step_by(2) {
        assert_eq!(allocator.payload(p)[0], (i + 1) as u8);
        allocator.deallocate(p);
    }
    for &p in objects.iter().skip(1).step_by(2) {
        let q = allocator.reallocate(p, 3000).unwrap();
        allocator.deallocate(q);
    }
    let report = allocator.check_heap();
    assert_eq!(report.free_blocks, 1);
    assert_eq!(allocator.grower().len(), allocator.hi().unwrap() + 1);
}

#[test]
fn test_logging() {
    let filter = EnvFilter::from_default_env().add_directive("seg_malloc=debug".parse().unwrap());
    let subscriber = Registry::default()
        .with(filter)
        .with(RecordEntryLayer::default())
        .with(Layer::new().with_test_writer().event_format(SimpleFormatter));

    tracing::subscriber::with_default(subscriber, || {
        let mut allocator = strict(1 << 16);
        let p = allocator.allocate(100).unwrap();
        let p = allocator.reallocate(p, 300).unwrap();
        allocator.deallocate(p);
        assert!(allocator.allocate(1 << 17).is_none());
    });
}
