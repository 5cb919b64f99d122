//! Property-based tests for the allocation map
//!
//! A byte-level bitmap over a small address space serves as the model.

use flashfs::{AllocationMap, OverlapPolicy};
use proptest::prelude::*;

const SPACE: u64 = 512;

fn model_intervals(model: &[bool]) -> Vec<(u64, u64)> {
    let mut out = Vec::new();
    let mut start = None;
    for (i, &used) in model.iter().enumerate() {
        match (used, start) {
            (true, None) => start = Some(i as u64),
            (false, Some(s)) => {
                out.push((s, i as u64 - s));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        out.push((s, model.len() as u64 - s));
    }
    out
}

fn actual_intervals(map: &AllocationMap) -> Vec<(u64, u64)> {
    map.intervals().map(|iv| (iv.offset, iv.length)).collect()
}

proptest! {
    #[test]
    fn prop_mark_used_matches_union(
        regions in prop::collection::vec((0u64..SPACE, 0u64..64), 1..40)
    ) {
        let mut map = AllocationMap::new();
        let mut model = vec![false; (SPACE + 64) as usize];
        for &(offset, length) in &regions {
            map.mark_used(offset, length, "prop").unwrap();
            for b in offset..offset + length {
                model[b as usize] = true;
            }
        }
        prop_assert!(map.check_invariants().is_ok());
        prop_assert_eq!(actual_intervals(&map), model_intervals(&model));
        prop_assert_eq!(map.used_bytes(), model.iter().filter(|&&u| u).count() as u64);
    }

    #[test]
    fn prop_free_inside_used_matches_model(
        regions in prop::collection::vec((0u64..SPACE, 1u64..64), 1..20),
        frees in prop::collection::vec((0u64..SPACE + 64, 1u64..32), 0..40)
    ) {
        let mut map = AllocationMap::new();
        let mut model = vec![false; (SPACE + 64) as usize];
        for &(offset, length) in &regions {
            map.mark_used(offset, length, "prop").unwrap();
            for b in offset..offset + length {
                model[b as usize] = true;
            }
        }
        for &(offset, length) in &frees {
            let end = (offset + length).min(model.len() as u64);
            let inside = end > offset && map.is_range_used(offset, end - offset);
            let result = map.mark_free(offset, end - offset);
            if inside {
                prop_assert!(result.is_ok());
                for b in offset..end {
                    model[b as usize] = false;
                }
            } else if end > offset {
                prop_assert!(result.is_err());
            }
        }
        prop_assert!(map.check_invariants().is_ok());
        prop_assert_eq!(actual_intervals(&map), model_intervals(&model));
    }

    #[test]
    fn prop_freeing_every_used_region_empties_map(
        layout in prop::collection::vec((0u64..32, 1u64..64), 1..20),
        rotate in 0usize..20
    ) {
        let mut map = AllocationMap::new();
        let mut regions = Vec::new();
        let mut cursor = 0u64;
        for &(gap, length) in &layout {
            cursor += gap;
            map.mark_used(cursor, length, "prop").unwrap();
            regions.push((cursor, length));
            cursor += length;
        }
        let total: u64 = regions.iter().map(|&(_, length)| length).sum();
        prop_assert_eq!(map.used_bytes(), total);

        let split = rotate % regions.len();
        regions.rotate_left(split);
        for &(offset, length) in &regions {
            prop_assert!(map.mark_free(offset, length).is_ok());
            prop_assert!(map.check_invariants().is_ok());
        }
        prop_assert_eq!(map.used_bytes(), 0);
        prop_assert!(map.is_empty());
    }

    #[test]
    fn prop_find_free_never_overlaps(
        seed in prop::collection::vec((0u64..SPACE, 1u64..64), 1..20),
        requests in prop::collection::vec(1u64..48, 1..20)
    ) {
        let mut map = AllocationMap::new();
        for &(offset, length) in &seed {
            map.mark_used(offset, length, "seed").unwrap();
        }
        for &length in &requests {
            let before = map.clone();
            let offset = map.find_free(length).unwrap();
            for b in offset..offset + length {
                prop_assert!(!before.is_used(b), "byte {:#x} handed out twice", b);
            }
            prop_assert!(map.is_range_used(offset, length));
            prop_assert_eq!(map.used_bytes(), before.used_bytes() + length);
        }
        prop_assert!(map.check_invariants().is_ok());
    }

    #[test]
    fn prop_strict_rejects_exactly_the_overlaps(
        regions in prop::collection::vec((0u64..SPACE, 1u64..64), 1..30)
    ) {
        let mut strict = AllocationMap::with_policy(OverlapPolicy::Strict);
        for &(offset, length) in &regions {
            let collides = (offset..offset + length).any(|b| strict.is_used(b));
            let before = actual_intervals(&strict);
            let result = strict.mark_used(offset, length, "strict");
            prop_assert_eq!(result.is_err(), collides);
            if collides {
                prop_assert_eq!(actual_intervals(&strict), before);
            }
        }
        prop_assert!(strict.check_invariants().is_ok());
    }
}
