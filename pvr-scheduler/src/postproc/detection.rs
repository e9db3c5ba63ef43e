//! Silence and black-frame detections and their reconciliation into
//! commercial breaks.

use std::sync::OnceLock;

use pvr_protocol::Commercial;
use regex::Regex;

/// Minimum gap between detections that separates content from a break.
pub const CONTENT_GAP_SECS: f64 = 300.0;

/// A raw interval reported by one analysis tool, in seconds.
///
/// Two detections are equal when their intervals overlap, touching
/// endpoints included. This equality is not transitive.
#[derive(Debug, Clone, Copy)]
pub struct Detection {
    pub start: f64,
    pub end: f64,
}

impl Detection {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn overlaps(&self, other: &Detection) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    fn intersection(&self, other: &Detection) -> Detection {
        Detection::new(self.start.max(other.start), self.end.min(other.end))
    }
}

impl PartialEq for Detection {
    fn eq(&self, other: &Self) -> bool {
        self.overlaps(other)
    }
}

fn sort_detections(list: &mut [Detection]) {
    list.sort_by(|a, b| a.start.total_cmp(&b.start).then(a.end.total_cmp(&b.end)));
}

fn silence_start_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"silence_start:\s*(-?[0-9.]+)").expect("valid regex"))
}

fn silence_end_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"silence_end:\s*(-?[0-9.]+)").expect("valid regex"))
}

fn black_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"black_start:\s*(-?[0-9.]+)\s+black_end:\s*(-?[0-9.]+)").expect("valid regex")
    })
}

/// Parse `silencedetect` output. Start and end arrive on separate lines
/// and are paired in order; an unmatched start is dropped.
pub fn parse_silence(output: &str) -> Vec<Detection> {
    let mut detections = Vec::new();
    let mut pending_start: Option<f64> = None;

    for line in output.lines() {
        if let Some(caps) = silence_start_re().captures(line) {
            pending_start = caps[1].parse().ok();
        } else if let Some(caps) = silence_end_re().captures(line) {
            if let (Some(start), Ok(end)) = (pending_start.take(), caps[1].parse::<f64>()) {
                detections.push(Detection::new(start.max(0.0), end));
            }
        }
    }

    sort_detections(&mut detections);
    detections
}

/// Parse `blackdetect` output, one interval per line.
pub fn parse_black(output: &str) -> Vec<Detection> {
    let mut detections: Vec<Detection> = output
        .lines()
        .filter_map(|line| {
            let caps = black_re().captures(line)?;
            let start = caps[1].parse::<f64>().ok()?;
            let end = caps[2].parse::<f64>().ok()?;
            Some(Detection::new(start.max(0.0), end))
        })
        .collect();
    sort_detections(&mut detections);
    detections
}

/// Intersect two detection lists under overlap equality.
///
/// Every overlapping pair contributes its common interval, so the result
/// does not depend on argument order.
pub fn merge(a: &[Detection], b: &[Detection]) -> Vec<Detection> {
    let mut merged: Vec<Detection> = a
        .iter()
        .flat_map(|x| b.iter().filter(move |y| x.overlaps(y)).map(move |y| x.intersection(y)))
        .collect();
    sort_detections(&mut merged);
    merged.dedup_by(|x, y| x.start == y.start && x.end == y.end);
    merged
}

/// Turn a sorted detection sequence into commercial breaks.
///
/// A synthetic detection at 0 is prepended. Every detection that follows
/// a gap longer than [`CONTENT_GAP_SECS`] is a marker; markers alternate
/// between break start and break end. A trailing start without an end
/// is dropped.
pub fn classify(detections: &[Detection]) -> Vec<Commercial> {
    let mut sequence = Vec::with_capacity(detections.len() + 1);
    sequence.push(Detection::new(0.0, 0.0));
    sequence.extend_from_slice(detections);

    let mut commercials = Vec::new();
    let mut open: Option<Detection> = None;

    for pair in sequence.windows(2) {
        let (previous, current) = (pair[0], pair[1]);
        if current.start - previous.end <= CONTENT_GAP_SECS {
            continue;
        }
        match open.take() {
            None => open = Some(current),
            Some(start) => commercials.push(Commercial::new(start.start, current.end)),
        }
    }

    commercials
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlap_equality() {
        let a = Detection::new(10.0, 20.0);
        assert_eq!(a, Detection::new(15.0, 25.0)); // overlapping
        assert_eq!(a, Detection::new(20.0, 30.0)); // touching
        assert_eq!(a, Detection::new(12.0, 13.0)); // contained
        assert_ne!(a, Detection::new(20.5, 30.0)); // disjoint
        assert_ne!(a, Detection::new(0.0, 9.9));
    }

    #[test]
    fn test_parse_silence_pairs_lines() {
        let output = "\
[silencedetect @ 0x5581] silence_start: 598.42
frame=1000 fps=250 q=-0.0 size=N/A time=00:10:00.00
[silencedetect @ 0x5581] silence_end: 600.98 | silence_duration: 2.56
[silencedetect @ 0x5581] silence_start: 12.5
[silencedetect @ 0x5581] silence_end: 13.0 | silence_duration: 0.5
[silencedetect @ 0x5581] silence_start: 1790.0
";
        let detections = parse_silence(output);
        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].start, 12.5);
        assert_eq!(detections[1].start, 598.42);
        assert_eq!(detections[1].end, 600.98);
    }

    #[test]
    fn test_parse_black_single_lines() {
        let output = "\
[blackdetect @ 0x55d1] black_start:599.5 black_end:601.2 black_duration:1.7
[Parsed_blackdetect_0 @ 0x55d1] black_start:0 black_end:0.48 black_duration:0.48
garbage line
";
        let detections = parse_black(output);
        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].start, 0.0);
        assert_eq!(detections[1].end, 601.2);
    }

    #[test]
    fn test_merge_is_commutative() {
        let silence = vec![
            Detection::new(10.0, 12.0),
            Detection::new(400.0, 402.0),
            Detection::new(900.0, 901.0),
        ];
        let black = vec![
            Detection::new(11.0, 11.5),
            Detection::new(401.5, 403.0),
            Detection::new(1200.0, 1201.0),
        ];

        let sb = merge(&silence, &black);
        let bs = merge(&black, &silence);

        assert_eq!(sb.len(), 2);
        assert_eq!(sb.len(), bs.len());
        for (x, y) in sb.iter().zip(bs.iter()) {
            assert_eq!((x.start, x.end), (y.start, y.end));
        }
        assert_eq!((sb[1].start, sb[1].end), (401.5, 402.0));
    }

    #[test]
    fn test_classify_single_break() {
        // content, gap > 300 (break starts), gap > 300 (break ends)
        let detections = vec![
            Detection::new(400.0, 401.0),
            Detection::new(420.0, 421.0),
            Detection::new(800.0, 801.0),
        ];
        let commercials = classify(&detections);
        assert_eq!(commercials, vec![Commercial::new(400.0, 801.0)]);
    }

    #[test]
    fn test_classify_needs_two_long_gaps() {
        assert!(classify(&[]).is_empty());
        assert!(classify(&[Detection::new(100.0, 101.0), Detection::new(200.0, 201.0)]).is_empty());
        // One long gap only opens a break
        assert!(classify(&[Detection::new(500.0, 501.0)]).is_empty());
    }

    #[test]
    fn test_classify_two_breaks() {
        let detections = vec![
            Detection::new(400.0, 401.0),
            Detection::new(800.0, 801.0),
            Detection::new(1200.0, 1201.0),
            Detection::new(1600.0, 1602.0),
        ];
        let commercials = classify(&detections);
        assert_eq!(
            commercials,
            vec![Commercial::new(400.0, 801.0), Commercial::new(1200.0, 1602.0)]
        );
    }
}
