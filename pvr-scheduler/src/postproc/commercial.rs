//! Rating-symbol inference, source selection and chapter output.

use std::fmt::Write as _;

use pvr_protocol::Commercial;

use super::detection::CONTENT_GAP_SECS;

/// Assumed length of a break ending where the rating symbol reappears.
pub const INFERRED_BREAK_SECS: f64 = 180.0;

/// Infer breaks from rating-symbol sightings (seconds, any order).
///
/// A sighting is kept only when the next sighting is more than
/// [`CONTENT_GAP_SECS`] later; closer ones are promo noise. Each kept
/// sighting ends a break of [`INFERRED_BREAK_SECS`]. Sightings inside
/// the first break length of the recording are skipped.
pub fn infer_from_rating(times: &[f64]) -> Vec<Commercial> {
    let mut sorted = times.to_vec();
    sorted.sort_by(f64::total_cmp);

    sorted
        .windows(2)
        .filter(|pair| pair[1] - pair[0] > CONTENT_GAP_SECS)
        .map(|pair| pair[0])
        .filter(|&end| end > INFERRED_BREAK_SECS)
        .map(|end| Commercial::new(end - INFERRED_BREAK_SECS, end))
        .collect()
}

/// Choose between the silence/black and the rating estimates.
///
/// The longer list wins; on a tie the silence/black list is kept. When
/// only one source produced a result it is used as is.
pub fn select_commercials(
    detected: Option<Vec<Commercial>>,
    rated: Option<Vec<Commercial>>,
) -> Option<Vec<Commercial>> {
    match (detected, rated) {
        (Some(detected), Some(rated)) if rated.len() > detected.len() => Some(rated),
        (Some(detected), _) => Some(detected),
        (None, rated) => rated,
    }
}

/// Format seconds as `HH:MM:SS.mmm`.
pub fn format_timestamp(secs: f64) -> String {
    let total_ms = (secs.max(0.0) * 1000.0).round() as u64;
    let ms = total_ms % 1000;
    let total_secs = total_ms / 1000;
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        total_secs / 3600,
        (total_secs / 60) % 60,
        total_secs % 60,
        ms
    )
}

/// Chapter file understood by the chapter-embedding tool.
///
/// Chapter 1 marks the start of the recording; break `n` (from zero)
/// becomes chapter `n + 2`.
pub fn chapter_file(commercials: &[Commercial]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "CHAPTER01={}", format_timestamp(0.0));
    let _ = writeln!(out, "CHAPTER01NAME=Start");
    for (n, commercial) in commercials.iter().enumerate() {
        let chapter = n + 2;
        let _ = writeln!(out, "CHAPTER{:02}={}", chapter, format_timestamp(commercial.start));
        let _ = writeln!(out, "CHAPTER{:02}NAME=Commercial {}", chapter, n + 1);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rating_single_break() {
        let commercials = infer_from_rating(&[200.0, 600.0]);
        assert_eq!(commercials, vec![Commercial::new(20.0, 200.0)]);
    }

    #[test]
    fn test_rating_skips_early_end() {
        assert!(infer_from_rating(&[180.0, 600.0]).is_empty());
        assert!(infer_from_rating(&[100.0, 600.0]).is_empty());
    }

    #[test]
    fn test_rating_filters_close_sightings() {
        // 1000 and 1100 are within the content gap; only 1100 -> 1500 qualifies
        let commercials = infer_from_rating(&[1100.0, 1000.0, 1500.0]);
        assert_eq!(commercials, vec![Commercial::new(920.0, 1100.0)]);
        assert!(infer_from_rating(&[]).is_empty());
        assert!(infer_from_rating(&[900.0]).is_empty());
    }

    #[test]
    fn test_select_prefers_longer_list() {
        let one = vec![Commercial::new(10.0, 20.0)];
        let two = vec![Commercial::new(10.0, 20.0), Commercial::new(30.0, 40.0)];

        assert_eq!(select_commercials(Some(one.clone()), Some(two.clone())), Some(two.clone()));
        assert_eq!(select_commercials(Some(two.clone()), Some(one.clone())), Some(two.clone()));
        // Tie keeps silence/black
        let other = vec![Commercial::new(50.0, 60.0)];
        assert_eq!(select_commercials(Some(one.clone()), Some(other.clone())), Some(one.clone()));
        // Missing sources
        assert_eq!(select_commercials(None, Some(other.clone())), Some(other));
        assert_eq!(select_commercials(Some(one.clone()), None), Some(one));
        assert_eq!(select_commercials(None, None), None);
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0.0), "00:00:00.000");
        assert_eq!(format_timestamp(61.5), "00:01:01.500");
        assert_eq!(format_timestamp(3723.042), "01:02:03.042");
    }

    #[test]
    fn test_chapter_numbering() {
        let text = chapter_file(&[Commercial::new(400.0, 580.0), Commercial::new(1300.5, 1480.0)]);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "CHAPTER01=00:00:00.000");
        assert_eq!(lines[2], "CHAPTER02=00:06:40.000");
        assert_eq!(lines[3], "CHAPTER02NAME=Commercial 1");
        assert_eq!(lines[4], "CHAPTER03=00:21:40.500");
    }
}
