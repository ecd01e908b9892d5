//! 变长分配管理器
//!
//! 在抽象的线性区间 `[0, max_size)` 上管理整数区间的分配和释放，不涉及任何 GPU 概念。
//! 空闲块同时按偏移和按大小建立索引：
//!
//! - 按大小索引用于最佳适配（best-fit）查找
//! - 按偏移索引用于释放时与相邻空闲块合并
//!
//! 两个索引都基于平衡树，分配和释放的复杂度为 `O(log n)`。
//!
//! # 对齐
//!
//! 管理器维护所有存活分配中观察到的最小对齐 `current_alignment`。
//! 所有空闲块的偏移都是它的倍数，因此请求更大对齐时，
//! 只需要预留 `alignment - current_alignment` 的填充即可保证块内存在对齐位置。

use std::collections::{BTreeMap, BTreeSet};

/// 一次分配的结果
///
/// `size` 已经包含满足对齐所需的前部填充；
/// `unaligned_offset` 是所选空闲块的起始位置，调用者需要自行向上对齐。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub unaligned_offset: usize,
    pub size: usize,
}

impl Allocation {
    /// 无效偏移的哨兵值
    pub const INVALID_OFFSET: usize = usize::MAX;

    pub fn new(unaligned_offset: usize, size: usize) -> Self {
        Self { unaligned_offset, size }
    }

    /// 表示分配失败
    pub fn invalid() -> Self {
        Self {
            unaligned_offset: Self::INVALID_OFFSET,
            size: 0,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.unaligned_offset != Self::INVALID_OFFSET
    }

    /// 按 `alignment` 向上对齐后的偏移
    pub fn aligned_offset(&self, alignment: usize) -> usize {
        align_up(self.unaligned_offset, alignment)
    }
}

/// 变长分配管理器
#[derive(Debug)]
pub struct VariableSizeAllocationsManager {
    /// 偏移 -> 大小
    free_blocks_by_offset: BTreeMap<usize, usize>,
    /// (大小, 偏移)，相同大小时偏移小的优先
    free_blocks_by_size: BTreeSet<(usize, usize)>,
    max_size: usize,
    free_size: usize,
    current_alignment: usize,
}

impl VariableSizeAllocationsManager {
    /// 创建覆盖 `[0, max_size)` 的管理器，整个区间初始为空闲
    pub fn new(max_size: usize) -> Self {
        let mut manager = Self {
            free_blocks_by_offset: BTreeMap::new(),
            free_blocks_by_size: BTreeSet::new(),
            max_size,
            free_size: max_size,
            current_alignment: 1,
        };
        if max_size > 0 {
            manager.add_block(0, max_size);
        }
        manager.reset_current_alignment();
        manager
    }

    /// 分配 `size` 个单位，起始位置可对齐到 `alignment`
    ///
    /// `alignment` 必须是 2 的幂。失败时返回 [`Allocation::invalid`]，从不 panic。
    pub fn allocate(&mut self, size: usize, alignment: usize) -> Allocation {
        assert!(
            alignment.is_power_of_two(),
            "Alignment ({}) must be a power of two",
            alignment
        );

        if size == 0 {
            return Allocation::invalid();
        }

        let Some(size) = checked_align_up(size, alignment) else {
            return Allocation::invalid();
        };
        if self.free_size < size {
            return Allocation::invalid();
        }

        let alignment_reserve = alignment.saturating_sub(self.current_alignment);
        // size 是 alignment 的倍数且 alignment_reserve < alignment，相加不会溢出
        let needed = size + alignment_reserve;

        // 最佳适配：不小于 needed 的最小块
        let Some(&(block_size, offset)) = self.free_blocks_by_size.range((needed, 0)..).next() else {
            return Allocation::invalid();
        };

        let aligned_offset = align_up(offset, alignment);
        let adjusted_size = size + (aligned_offset - offset);
        debug_assert!(
            adjusted_size <= block_size,
            "Free block at {} is not aligned to the current alignment {}",
            offset,
            self.current_alignment
        );

        self.remove_block(offset, block_size);
        let remainder = block_size - adjusted_size;
        if remainder > 0 {
            self.add_block(offset + adjusted_size, remainder);
        }
        self.free_size -= adjusted_size;

        if size & (self.current_alignment - 1) != 0 {
            self.current_alignment = if size.is_power_of_two() {
                self.current_alignment.min(size)
            } else {
                self.current_alignment.min(alignment)
            };
        }

        Allocation::new(offset, adjusted_size)
    }

    /// 释放 `[offset, offset + size)`，并与紧邻的空闲块合并
    pub fn free(&mut self, offset: usize, size: usize) {
        debug_assert!(size > 0, "Freeing an empty range at {}", offset);
        debug_assert!(
            offset + size <= self.max_size,
            "Range [{}, {}) is outside of the managed space [0, {})",
            offset,
            offset + size,
            self.max_size
        );

        let prev = self
            .free_blocks_by_offset
            .range(..offset)
            .next_back()
            .map(|(&o, &s)| (o, s));
        let next = self
            .free_blocks_by_offset
            .range(offset..)
            .next()
            .map(|(&o, &s)| (o, s));

        if let Some((prev_offset, prev_size)) = prev {
            debug_assert!(
                prev_offset + prev_size <= offset,
                "Range [{}, {}) overlaps free block [{}, {})",
                offset,
                offset + size,
                prev_offset,
                prev_offset + prev_size
            );
        }
        if let Some((next_offset, next_size)) = next {
            debug_assert!(
                offset + size <= next_offset,
                "Range [{}, {}) overlaps free block [{}, {})",
                offset,
                offset + size,
                next_offset,
                next_offset + next_size
            );
        }

        let touches_prev = prev.filter(|&(o, s)| o + s == offset);
        let touches_next = next.filter(|&(o, _)| offset + size == o);

        let (new_offset, new_size) = match (touches_prev, touches_next) {
            // 与前后两块三路合并
            (Some((prev_offset, prev_size)), Some((next_offset, next_size))) => {
                self.remove_block(prev_offset, prev_size);
                self.remove_block(next_offset, next_size);
                (prev_offset, prev_size + size + next_size)
            }
            (Some((prev_offset, prev_size)), None) => {
                self.remove_block(prev_offset, prev_size);
                (prev_offset, prev_size + size)
            }
            (None, Some((next_offset, next_size))) => {
                self.remove_block(next_offset, next_size);
                (offset, size + next_size)
            }
            (None, None) => (offset, size),
        };

        self.add_block(new_offset, new_size);
        self.free_size += size;

        if self.is_empty() {
            debug_assert_eq!(self.free_blocks_num(), 1);
            self.reset_current_alignment();
        }
    }

    /// 在末尾追加 `extra_size` 的空闲空间
    pub fn extend(&mut self, extra_size: usize) {
        if extra_size == 0 {
            return;
        }

        let mut new_offset = self.max_size;
        let mut new_size = extra_size;

        let trailing = self
            .free_blocks_by_offset
            .iter()
            .next_back()
            .map(|(&o, &s)| (o, s));
        if let Some((last_offset, last_size)) = trailing {
            if last_offset + last_size == self.max_size {
                self.remove_block(last_offset, last_size);
                new_offset = last_offset;
                new_size += last_size;
            }
        }

        self.add_block(new_offset, new_size);
        self.max_size += extra_size;
        self.free_size += extra_size;

        if self.is_empty() {
            self.reset_current_alignment();
        } else if new_offset != 0 {
            // 新块的偏移也必须是 current_alignment 的倍数
            let offset_alignment = 1usize << new_offset.trailing_zeros();
            self.current_alignment = self.current_alignment.min(offset_alignment);
        }
    }

    pub fn is_full(&self) -> bool {
        self.free_size == 0
    }

    pub fn is_empty(&self) -> bool {
        self.free_size == self.max_size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn free_size(&self) -> usize {
        self.free_size
    }

    pub fn used_size(&self) -> usize {
        self.max_size - self.free_size
    }

    pub fn free_blocks_num(&self) -> usize {
        debug_assert_eq!(self.free_blocks_by_offset.len(), self.free_blocks_by_size.len());
        self.free_blocks_by_offset.len()
    }

    /// 当前记录的最小对齐
    pub fn current_alignment(&self) -> usize {
        self.current_alignment
    }

    /// 按偏移升序遍历空闲块 `(offset, size)`
    pub fn free_blocks(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.free_blocks_by_offset.iter().map(|(&o, &s)| (o, s))
    }

    fn add_block(&mut self, offset: usize, size: usize) {
        let previous = self.free_blocks_by_offset.insert(offset, size);
        debug_assert!(previous.is_none(), "Duplicate free block at {}", offset);
        self.free_blocks_by_size.insert((size, offset));
    }

    fn remove_block(&mut self, offset: usize, size: usize) {
        self.free_blocks_by_offset.remove(&offset);
        let removed = self.free_blocks_by_size.remove(&(size, offset));
        debug_assert!(removed, "Free block [{}, {}) is not indexed by size", offset, offset + size);
    }

    /// 没有存活分配时，采用不超过 max_size 的最大 2 的幂作为对齐
    fn reset_current_alignment(&mut self) {
        self.current_alignment = if self.max_size == 0 {
            1
        } else {
            1usize << (usize::BITS - 1 - self.max_size.leading_zeros())
        };
    }
}

/// 将 `value` 向上对齐到 `alignment`（2 的幂）
pub fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// 同 [`align_up`]，结果超出 `usize` 时返回 `None`
pub fn checked_align_up(value: usize, alignment: usize) -> Option<usize> {
    debug_assert!(alignment.is_power_of_two());
    value
        .checked_add(alignment - 1)
        .map(|sum| sum & !(alignment - 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn assert_conserved(manager: &VariableSizeAllocationsManager) {
        assert_eq!(manager.free_size() + manager.used_size(), manager.max_size());
        let free_sum: usize = manager.free_blocks().map(|(_, s)| s).sum();
        assert_eq!(free_sum, manager.free_size());
    }

    #[test]
    fn test_initial_state() {
        let manager = VariableSizeAllocationsManager::new(100);
        assert!(manager.is_empty());
        assert!(!manager.is_full());
        assert_eq!(manager.free_blocks_num(), 1);
        assert_eq!(manager.current_alignment(), 64);
        assert_eq!(manager.used_size(), 0);

        let mut empty = VariableSizeAllocationsManager::new(0);
        assert!(empty.is_full());
        assert_eq!(empty.free_blocks_num(), 0);
        assert!(!empty.allocate(1, 1).is_valid());
    }

    #[test]
    fn test_end_to_end_reuses_front_gap() {
        let mut manager = VariableSizeAllocationsManager::new(100);

        let a = manager.allocate(16, 1);
        assert_eq!(a, Allocation::new(0, 16));

        let b = manager.allocate(24, 1);
        assert_eq!(b, Allocation::new(16, 24));

        manager.free(a.unaligned_offset, a.size);
        assert_conserved(&manager);

        let c = manager.allocate(10, 1);
        assert_eq!(c.unaligned_offset, 0);
        assert_eq!(c.size, 10);
        assert_conserved(&manager);
    }

    #[test]
    fn test_best_fit_selection() {
        let mut manager = VariableSizeAllocationsManager::new(16 + 4 + 24 + 4 + 40);

        // 用 4 个单位的分隔块构造空闲块 {16, 24, 40}
        let first = manager.allocate(16, 1);
        let sep1 = manager.allocate(4, 1);
        let second = manager.allocate(24, 1);
        let sep2 = manager.allocate(4, 1);
        assert!(sep1.is_valid() && sep2.is_valid());
        assert_eq!(manager.free_size(), 40);

        manager.free(first.unaligned_offset, first.size);
        manager.free(second.unaligned_offset, second.size);
        assert_eq!(manager.free_blocks_num(), 3);

        let fit = manager.allocate(20, 1);
        assert_eq!(fit.unaligned_offset, second.unaligned_offset);
        assert_eq!(fit.size, 20);
    }

    #[test]
    fn test_round_trip_restores_state() {
        for size in [1, 7, 32, 99, 100] {
            let mut manager = VariableSizeAllocationsManager::new(100);
            let blocks_before = manager.free_blocks_num();
            let free_before = manager.free_size();

            let allocation = manager.allocate(size, 1);
            assert!(allocation.is_valid());
            manager.free(allocation.unaligned_offset, allocation.size);

            assert_eq!(manager.free_blocks_num(), blocks_before);
            assert_eq!(manager.free_size(), free_before);
            assert_eq!(manager.current_alignment(), 64);
        }
    }

    #[test]
    fn test_coalescing_in_either_order() {
        for reverse in [false, true] {
            let mut manager = VariableSizeAllocationsManager::new(100);
            let a = manager.allocate(30, 1);
            let b = manager.allocate(70, 1);
            assert!(manager.is_full());
            assert_eq!(manager.free_blocks_num(), 0);

            if reverse {
                manager.free(b.unaligned_offset, b.size);
                manager.free(a.unaligned_offset, a.size);
            } else {
                manager.free(a.unaligned_offset, a.size);
                manager.free(b.unaligned_offset, b.size);
            }

            assert_eq!(manager.free_blocks().collect::<Vec<_>>(), vec![(0, 100)]);
        }
    }

    #[test]
    fn test_three_way_merge() {
        let mut manager = VariableSizeAllocationsManager::new(30);
        let a = manager.allocate(10, 1);
        let b = manager.allocate(10, 1);
        let c = manager.allocate(10, 1);

        manager.free(a.unaligned_offset, a.size);
        manager.free(c.unaligned_offset, c.size);
        assert_eq!(manager.free_blocks_num(), 2);

        manager.free(b.unaligned_offset, b.size);
        assert_eq!(manager.free_blocks().collect::<Vec<_>>(), vec![(0, 30)]);
        assert!(manager.is_empty());
    }

    #[test]
    fn test_allocation_failure_returns_sentinel() {
        let mut manager = VariableSizeAllocationsManager::new(32);
        assert!(!manager.allocate(33, 1).is_valid());
        assert!(!manager.allocate(0, 1).is_valid());

        let a = manager.allocate(16, 1);
        let _b = manager.allocate(8, 1);
        manager.free(a.unaligned_offset, a.size);

        // 空闲 24 个单位，但没有连续的 20 个
        assert_eq!(manager.free_size(), 24);
        let failed = manager.allocate(20, 1);
        assert!(!failed.is_valid());
        assert_eq!(failed.unaligned_offset, Allocation::INVALID_OFFSET);
        assert_eq!(manager.free_size(), 24);
    }

    #[test]
    fn test_alignment() {
        // 每次请求都要预留 alignment - current_alignment，空间必须足够
        let mut manager = VariableSizeAllocationsManager::new(512);

        // 非 2 的幂大小将 current_alignment 降到 1
        let odd = manager.allocate(3, 1);
        assert_eq!(odd, Allocation::new(0, 3));
        assert_eq!(manager.current_alignment(), 1);

        let aligned = manager.allocate(10, 16);
        assert!(aligned.is_valid());
        assert!(aligned.size >= 10);
        let start = aligned.aligned_offset(16);
        assert_eq!(start % 16, 0);
        assert!(start + 16 <= aligned.unaligned_offset + aligned.size);
        assert_conserved(&manager);

        for alignment in [1usize, 2, 4, 8, 32] {
            for size in [1usize, 5, 13] {
                let allocation = manager.allocate(size, alignment);
                assert!(allocation.is_valid());
                assert!(allocation.size >= size);
                let start = allocation.aligned_offset(alignment);
                assert!(start + size <= allocation.unaligned_offset + allocation.size);
            }
        }
        assert_conserved(&manager);
    }

    #[test]
    fn test_huge_request_returns_sentinel() {
        let mut manager = VariableSizeAllocationsManager::new(64);

        // 向上对齐时溢出
        assert!(!manager.allocate(usize::MAX, 2).is_valid());
        assert!(!manager.allocate(usize::MAX - 3, 16).is_valid());
        assert_eq!(manager.free_size(), 64);

        let odd = manager.allocate(3, 1);
        assert!(!manager.allocate(usize::MAX - 7, 8).is_valid());
        assert!(!manager.allocate(usize::MAX, 1).is_valid());
        assert_eq!(manager.free_size(), 61);

        manager.free(odd.unaligned_offset, odd.size);
        assert!(manager.is_empty());
        assert_eq!(checked_align_up(usize::MAX, 4), None);
        assert_eq!(checked_align_up(13, 8), Some(16));
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn test_non_power_of_two_alignment_panics() {
        let mut manager = VariableSizeAllocationsManager::new(64);
        manager.allocate(8, 3);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "overlaps")]
    fn test_double_free_panics() {
        let mut manager = VariableSizeAllocationsManager::new(64);
        let a = manager.allocate(8, 1);
        let _b = manager.allocate(8, 1);
        manager.free(a.unaligned_offset, a.size);
        manager.free(a.unaligned_offset, a.size);
    }

    #[test]
    fn test_extend() {
        let mut manager = VariableSizeAllocationsManager::new(16);
        let a = manager.allocate(8, 1);
        assert!(a.is_valid());

        // 末尾空闲块 [8, 16) 与新空间合并
        manager.extend(16);
        assert_eq!(manager.max_size(), 32);
        assert_eq!(manager.free_blocks().collect::<Vec<_>>(), vec![(8, 24)]);

        let full = manager.allocate(24, 1);
        assert_eq!(full, Allocation::new(8, 24));
        assert!(manager.is_full());

        // 末尾没有空闲块时追加独立的新块
        manager.extend(10);
        assert_eq!(manager.free_blocks().collect::<Vec<_>>(), vec![(32, 10)]);
        assert_conserved(&manager);

        manager.free(a.unaligned_offset, a.size);
        manager.free(full.unaligned_offset, full.size);
        assert!(manager.is_empty());
        assert_eq!(manager.free_blocks().collect::<Vec<_>>(), vec![(0, 42)]);
        assert_eq!(manager.current_alignment(), 32);
    }

    #[test]
    fn test_extend_keeps_alignment_reachable() {
        let mut manager = VariableSizeAllocationsManager::new(100);
        let a = manager.allocate(64, 64);
        let b = manager.allocate(36, 4);
        assert!(a.is_valid() && b.is_valid());
        assert!(manager.is_full());

        manager.extend(64);
        let c = manager.allocate(16, 16);
        assert!(c.is_valid());
        assert_eq!(c.aligned_offset(16) % 16, 0);
        assert!(c.aligned_offset(16) + 16 <= c.unaligned_offset + c.size);
    }

    #[test]
    fn test_random_sequence_never_overlaps() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut manager = VariableSizeAllocationsManager::new(1024);
        let mut live: Vec<Allocation> = Vec::new();

        for _ in 0..2000 {
            if live.is_empty() || rng.gen_bool(0.6) {
                let size = rng.gen_range(1..=48);
                let alignment = 1usize << rng.gen_range(0..4u32);
                let allocation = manager.allocate(size, alignment);
                if allocation.is_valid() {
                    assert!(allocation.size >= size);
                    let start = allocation.aligned_offset(alignment);
                    assert!(start + size <= allocation.unaligned_offset + allocation.size);
                    live.push(allocation);
                }
            } else {
                let index = rng.gen_range(0..live.len());
                let allocation = live.swap_remove(index);
                manager.free(allocation.unaligned_offset, allocation.size);
            }

            assert_conserved(&manager);
            let used: usize = live.iter().map(|a| a.size).sum();
            assert_eq!(used, manager.used_size());

            let mut ranges: Vec<(usize, usize)> = live
                .iter()
                .map(|a| (a.unaligned_offset, a.unaligned_offset + a.size))
                .collect();
            ranges.sort_unstable();
            for pair in ranges.windows(2) {
                assert!(pair[0].1 <= pair[1].0, "{:?} overlaps {:?}", pair[0], pair[1]);
            }
        }

        for allocation in live.drain(..) {
            manager.free(allocation.unaligned_offset, allocation.size);
        }
        assert!(manager.is_empty());
        assert_eq!(manager.free_blocks_num(), 1);
    }
}
