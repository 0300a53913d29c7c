use serde::Serialize;

use crate::{error::PlanError, types::Window};

/// Tiles `[checkpoint_block, head_block - confirmation_margin]` into consecutive
/// windows of at most `max_window_size` blocks.
///
/// Returns an empty plan when the safe head does not lie beyond the checkpoint.
/// Windows start at the checkpoint itself so the last processed block is
/// rescanned; upserts make that overlap harmless.
pub fn plan(
    checkpoint_block: u64,
    head_block: u64,
    max_window_size: u64,
    confirmation_margin: u64,
) -> Vec<Window> {
    let safe_head = head_block.saturating_sub(confirmation_margin);
    tile(checkpoint_block, safe_head, max_window_size)
}

fn tile(from: u64, to: u64, max_window_size: u64) -> Vec<Window> {
    if to <= from || max_window_size == 0 {
        return Vec::new();
    }

    let mut windows = Vec::new();
    let mut start = from;
    while start <= to {
        let end = start.saturating_add(max_window_size - 1).min(to);
        windows.push(Window::new(start, end));
        if end == u64::MAX {
            break;
        }
        start = end + 1;
    }
    windows
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanRequest {
    /// Last durably processed block, `None` for a cold key.
    pub checkpoint_block: Option<u64>,
    pub head_block: u64,
    pub start_block: u64,
    /// Upper bound of an explicit-range backfill.
    pub target_end: Option<u64>,
}

/// Dry-run view of the windows a scan would process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanReport {
    pub from_block: u64,
    pub head_block: u64,
    pub safe_head: u64,
    pub lag_blocks: u64,
    pub total_blocks: u64,
    pub windows: Vec<Window>,
}

#[derive(Debug, Clone, Copy)]
pub struct Planner {
    max_window_size: u64,
    confirmation_margin: u64,
}

impl Planner {
    pub fn new(max_window_size: u64, confirmation_margin: u64) -> Result<Self, PlanError> {
        if max_window_size == 0 {
            return Err(PlanError::ZeroWindowSize);
        }
        Ok(Self {
            max_window_size,
            confirmation_margin,
        })
    }

    pub fn max_window_size(&self) -> u64 {
        self.max_window_size
    }

    pub fn plan(&self, request: &PlanRequest) -> PlanReport {
        let from_block = request.checkpoint_block.unwrap_or(request.start_block);
        let safe_head = request
            .head_block
            .saturating_sub(self.confirmation_margin)
            .max(request.start_block);
        let end = request
            .target_end
            .map_or(safe_head, |target| target.min(safe_head));

        let windows = tile(from_block, end, self.max_window_size);
        let total_blocks = windows.iter().map(Window::block_count).sum();

        PlanReport {
            from_block,
            head_block: request.head_block,
            safe_head,
            lag_blocks: safe_head.saturating_sub(from_block),
            total_blocks,
            windows,
        }
    }

    /// Plans an explicit `[from, to]` range, ignoring any stored checkpoint.
    pub fn plan_range(&self, from: u64, to: u64, head_block: u64) -> Result<PlanReport, PlanError> {
        if to < from {
            return Err(PlanError::InvalidRange { from, to });
        }
        let mut report = self.plan(&PlanRequest {
            checkpoint_block: Some(from),
            head_block,
            start_block: from,
            target_end: Some(to),
        });
        // A single-block range is still a scan, unlike a caught-up checkpoint.
        if report.windows.is_empty() && from == to && to <= report.safe_head {
            report.windows.push(Window::new(from, to));
            report.total_blocks = 1;
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds(windows: &[Window]) -> Vec<(u64, u64)> {
        windows.iter().map(|w| (w.from, w.to)).collect()
    }

    #[test]
    fn test_plan_tiles_up_to_safe_head() {
        let windows = plan(100, 250, 50, 20);
        assert_eq!(bounds(&windows), vec![(100, 149), (150, 199), (200, 230)]);
    }

    #[test]
    fn test_plan_is_empty_when_caught_up() {
        assert!(plan(100, 110, 50, 20).is_empty());
        assert!(plan(100, 120, 50, 20).is_empty());
        assert!(plan(0, 5, 50, 20).is_empty());
    }

    #[test]
    fn test_plan_covers_range_without_gaps_or_overlap() {
        for (checkpoint, head, size, margin) in [
            (0u64, 10_000u64, 7u64, 3u64),
            (17, 18_003, 1_000, 0),
            (5, 6, 1, 0),
            (1_000, 1_999, 2_000, 12),
        ] {
            let windows = plan(checkpoint, head, size, margin);
            let safe_head = head - margin;
            assert_eq!(windows.first().map(|w| w.from), Some(checkpoint));
            assert_eq!(windows.last().map(|w| w.to), Some(safe_head));
            for pair in windows.windows(2) {
                assert_eq!(pair[0].to + 1, pair[1].from);
            }
            assert!(windows.iter().all(|w| w.from <= w.to && w.block_count() <= size));
        }
    }

    #[test]
    fn test_planner_uses_start_block_for_cold_key() {
        let planner = Planner::new(50, 20).unwrap();
        let report = planner.plan(&PlanRequest {
            checkpoint_block: None,
            head_block: 250,
            start_block: 100,
            target_end: None,
        });
        assert_eq!(report.from_block, 100);
        assert_eq!(report.safe_head, 230);
        assert_eq!(report.lag_blocks, 130);
        assert_eq!(report.total_blocks, 131);
        assert_eq!(report.windows.len(), 3);
    }

    #[test]
    fn test_planner_stops_at_target_end() {
        let planner = Planner::new(50, 20).unwrap();
        let report = planner.plan_range(100, 160, 10_000).unwrap();
        assert_eq!(bounds(&report.windows), vec![(100, 149), (150, 160)]);

        let single = planner.plan_range(500, 500, 10_000).unwrap();
        assert_eq!(bounds(&single.windows), vec![(500, 500)]);

        assert!(matches!(
            planner.plan_range(10, 5, 10_000),
            Err(PlanError::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_zero_window_size_is_rejected() {
        assert!(matches!(Planner::new(0, 12), Err(PlanError::ZeroWindowSize)));
    }
}
