//! Voice-activity segment planning and merging.
//!
//! VAD output is used only to strip silence: the surviving segments are
//! concatenated back into one continuous waveform and recognized in a
//! single pass. Recognizing segments independently and concatenating the
//! *text* duplicates words at segment boundaries, so that is deliberately
//! never done here.

use crate::inference::RawResult;

/// Sample-index conversion factor for millisecond boundaries (16 kHz).
pub const SAMPLES_PER_MS: usize = 16;

/// Segments shorter than this (20 ms) are presumed VAD noise artifacts.
pub const MIN_SEGMENT_SAMPLES: usize = 320;

/// A half-open sample range `[start, end)` into a waveform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentSpan {
    pub start: usize,
    pub end: usize,
}

impl SegmentSpan {
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Recursively extracts every `(startMs, endMs)` pair from a VAD result.
///
/// The result shape is not contractually fixed across backends, so any
/// two-element all-numeric sequence found at any nesting depth counts as a
/// boundary pair. This tolerance is confined to this adapter; everything
/// downstream operates on typed spans.
pub fn extract_boundary_pairs(result: &RawResult) -> Vec<(f64, f64)> {
    let mut pairs = Vec::new();
    collect_pairs(result, &mut pairs);
    pairs
}

fn collect_pairs(node: &RawResult, pairs: &mut Vec<(f64, f64)>) {
    if let RawResult::List(items) = node {
        if let [RawResult::Number(start), RawResult::Number(end)] = items.as_slice() {
            pairs.push((*start, *end));
            return;
        }
        for item in items {
            collect_pairs(item, pairs);
        }
    }
}

/// Deduplicates, sorts, clamps, and floor-filters boundary pairs into
/// non-overlapping spans over a waveform of `waveform_len` samples.
///
/// Overlapping pairs are coalesced: a span starting inside its
/// predecessor keeps only its tail, so no sample is ever merged twice.
pub fn plan_segments(pairs: &[(f64, f64)], waveform_len: usize) -> Vec<SegmentSpan> {
    let mut seen: Vec<(i64, i64)> = Vec::new();
    let mut deduped: Vec<(f64, f64)> = Vec::new();
    for &(start_ms, end_ms) in pairs {
        let key = (start_ms.round() as i64, end_ms.round() as i64);
        if seen.contains(&key) {
            continue;
        }
        seen.push(key);
        deduped.push((start_ms, end_ms));
    }
    deduped.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.total_cmp(&b.1)));

    let mut spans: Vec<SegmentSpan> = Vec::new();
    for (start_ms, end_ms) in deduped {
        let mut start = ((start_ms * SAMPLES_PER_MS as f64) as i64).max(0) as usize;
        let end = (((end_ms * SAMPLES_PER_MS as f64) as i64).max(0) as usize).min(waveform_len);
        if let Some(prev) = spans.last() {
            start = start.max(prev.end);
        }
        if end <= start {
            continue;
        }
        if end - start < MIN_SEGMENT_SAMPLES {
            continue;
        }
        spans.push(SegmentSpan { start, end });
    }
    spans
}

/// Turns a VAD result into spans for a non-empty waveform.
///
/// Guarantee: the returned list is never empty — when no usable pair
/// survives filtering, the whole waveform stands in as one segment.
pub fn segment_spans(result: &RawResult, waveform_len: usize) -> Vec<SegmentSpan> {
    let pairs = extract_boundary_pairs(result);
    let spans = plan_segments(&pairs, waveform_len);
    if spans.is_empty() {
        return vec![SegmentSpan {
            start: 0,
            end: waveform_len,
        }];
    }
    spans
}

/// Concatenates the spans' samples into the single waveform the acoustic
/// model sees. Zero spans → the fallback waveform unchanged.
pub fn merge_for_recognition(spans: &[SegmentSpan], waveform: &[f32]) -> Vec<f32> {
    match spans {
        [] => waveform.to_vec(),
        [only] => waveform[only.start..only.end].to_vec(),
        _ => {
            let mut merged = Vec::with_capacity(spans.iter().map(SegmentSpan::len).sum());
            for span in spans {
                if !span.is_empty() {
                    merged.extend_from_slice(&waveform[span.start..span.end]);
                }
            }
            if merged.is_empty() {
                return waveform.to_vec();
            }
            merged
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_are_found_at_any_nesting_depth() {
        let result = RawResult::List(vec![
            RawResult::List(vec![RawResult::pair(0.0, 100.0), RawResult::pair(150.0, 400.0)]),
            RawResult::Map(vec![("value".into(), RawResult::pair(500.0, 900.0))]),
        ]);
        // Map values are opaque — only sequences are scanned.
        assert_eq!(
            extract_boundary_pairs(&result),
            vec![(0.0, 100.0), (150.0, 400.0)]
        );
    }

    #[test]
    fn non_numeric_and_wrong_arity_sequences_are_skipped() {
        let result = RawResult::List(vec![
            RawResult::List(vec![RawResult::Text("0".into()), RawResult::Number(5.0)]),
            RawResult::List(vec![
                RawResult::Number(1.0),
                RawResult::Number(2.0),
                RawResult::Number(3.0),
            ]),
            RawResult::pair(40.0, 80.0),
        ]);
        // The 3-element list is recursed into, not treated as a pair; its
        // scalar children contribute nothing.
        assert_eq!(extract_boundary_pairs(&result), vec![(40.0, 80.0)]);
    }

    #[test]
    fn duplicate_pairs_dedupe_on_rounded_milliseconds() {
        let pairs = vec![(100.0, 300.0), (100.4, 299.6), (100.0, 300.0)];
        let spans = plan_segments(&pairs, 16_000);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0], SegmentSpan { start: 1_600, end: 4_800 });
    }

    #[test]
    fn spans_are_sorted_clamped_and_floor_filtered() {
        let pairs = vec![
            (900.0, 860.0),   // inverted → dropped
            (500.0, 515.0),   // 240 samples < floor → dropped
            (-50.0, 100.0),   // clamped to start 0
            (950.0, 5_000.0), // clamped to waveform end
        ];
        let spans = plan_segments(&pairs, 16_000);
        assert_eq!(
            spans,
            vec![
                SegmentSpan { start: 0, end: 1_600 },
                SegmentSpan { start: 15_200, end: 16_000 },
            ]
        );
    }

    #[test]
    fn overlapping_pairs_keep_only_the_later_tail() {
        let pairs = vec![(0.0, 100.0), (50.0, 150.0)];
        let spans = plan_segments(&pairs, 100_000);
        assert_eq!(
            spans,
            vec![
                SegmentSpan { start: 0, end: 1_600 },
                SegmentSpan { start: 1_600, end: 2_400 },
            ]
        );

        // A pair fully contained in its predecessor contributes nothing.
        let pairs = vec![(0.0, 100.0), (10.0, 20.0)];
        let spans = plan_segments(&pairs, 100_000);
        assert_eq!(spans, vec![SegmentSpan { start: 0, end: 1_600 }]);
    }

    #[test]
    fn equal_start_pairs_do_not_duplicate_samples() {
        let pairs = vec![(0.0, 40.0), (0.0, 60.0)];
        let spans = plan_segments(&pairs, 100_000);
        assert_eq!(
            spans,
            vec![
                SegmentSpan { start: 0, end: 640 },
                SegmentSpan { start: 640, end: 960 },
            ]
        );
    }

    #[test]
    fn surviving_spans_are_non_overlapping_and_strictly_increasing() {
        let pairs = vec![
            (0.0, 40.0),
            (40.0, 90.0),
            (200.0, 260.0),
            (0.0, 40.0),
            (120.0, 180.0),
            // Overlapping and equal-start pairs must coalesce, not stack.
            (150.0, 230.0),
            (200.0, 320.0),
        ];
        let spans = plan_segments(&pairs, 100_000);
        assert!(!spans.is_empty());
        for window in spans.windows(2) {
            assert!(
                window[0].start < window[1].start,
                "starts not strictly increasing: {spans:?}"
            );
            assert!(
                window[0].end <= window[1].start,
                "spans overlap: {spans:?}"
            );
        }
    }

    #[test]
    fn no_usable_pairs_falls_back_to_whole_waveform() {
        let spans = segment_spans(&RawResult::None, 4_000);
        assert_eq!(spans, vec![SegmentSpan { start: 0, end: 4_000 }]);

        // Pairs exist but all collapse below the floor.
        let tiny = RawResult::List(vec![RawResult::pair(0.0, 10.0)]);
        let spans = segment_spans(&tiny, 4_000);
        assert_eq!(spans, vec![SegmentSpan { start: 0, end: 4_000 }]);
    }

    #[test]
    fn merge_concatenates_in_span_order() {
        let waveform: Vec<f32> = (0..1_000).map(|i| i as f32).collect();
        let spans = vec![
            SegmentSpan { start: 0, end: 320 },
            SegmentSpan { start: 640, end: 960 },
        ];
        let merged = merge_for_recognition(&spans, &waveform);
        assert_eq!(merged.len(), 640);
        assert_eq!(merged[0], 0.0);
        assert_eq!(merged[319], 319.0);
        assert_eq!(merged[320], 640.0);
        assert_eq!(merged[639], 959.0);
    }

    #[test]
    fn merge_with_no_spans_returns_fallback() {
        let waveform = vec![0.25f32; 500];
        let merged = merge_for_recognition(&[], &waveform);
        assert_eq!(merged, waveform);
    }
}
