//! Sliding windows over an ordered utterance sequence.

use parlgraph_store::Utterance;

pub const DEFAULT_WINDOW_SIZE: usize = 10;
pub const DEFAULT_STRIDE: usize = 6;
/// Utterances shorter than this are dropped when filtering is enabled.
pub const MIN_UTTERANCE_LENGTH: usize = 15;

/// A borrowed, contiguous run of utterances with derived views.
#[derive(Debug, Clone, Copy)]
pub struct Window<'a> {
    pub utterances: &'a [&'a Utterance],
    pub window_index: usize,
    pub stride: usize,
    pub size: usize,
}

impl<'a> Window<'a> {
    pub fn video_id(&self) -> &'a str {
        self.utterances
            .first()
            .map(|u| u.youtube_video_id.as_str())
            .unwrap_or_default()
    }

    /// One `[utterance_id=.. t=.. speaker_id=..] text` line per utterance.
    pub fn text(&self) -> String {
        self.utterances
            .iter()
            .map(|u| {
                format!(
                    "[utterance_id={} t={} speaker_id={}] {}",
                    u.id, u.timestamp, u.speaker_id, u.text
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn utterance_ids(&self) -> Vec<&'a str> {
        self.utterances.iter().map(|u| u.id.as_str()).collect()
    }

    /// Distinct speaker ids in first-seen order.
    pub fn speaker_ids(&self) -> Vec<&'a str> {
        let mut seen = Vec::new();
        for u in self.utterances {
            if !seen.contains(&u.speaker_id.as_str()) {
                seen.push(u.speaker_id.as_str());
            }
        }
        seen
    }

    fn earliest(&self) -> Option<&'a Utterance> {
        self.utterances
            .iter()
            .copied()
            .min_by_key(|u| u.seconds_since_start)
    }

    pub fn earliest_seconds(&self) -> Option<i64> {
        self.earliest().map(|u| u.seconds_since_start)
    }

    pub fn earliest_timestamp(&self) -> Option<&'a str> {
        self.earliest().map(|u| u.timestamp.as_str())
    }

    pub fn utterance(&self, id: &str) -> Option<&'a Utterance> {
        self.utterances.iter().copied().find(|u| u.id == id)
    }
}

/// Drops short utterances when `filter_short` is set. Returns references so
/// windows can borrow without copying transcript text.
pub fn prepare_utterances(utterances: &[Utterance], filter_short: bool) -> Vec<&Utterance> {
    utterances
        .iter()
        .filter(|u| !filter_short || u.text.chars().count() >= MIN_UTTERANCE_LENGTH)
        .collect()
}

/// Windows start at `0, stride, 2*stride, ...`. A tail that cannot fill a
/// whole window is dropped. Zero size or stride yields nothing.
pub fn build_windows<'a>(
    utterances: &'a [&'a Utterance],
    window_size: usize,
    stride: usize,
) -> Vec<Window<'a>> {
    let mut windows = Vec::new();
    if window_size == 0 || stride == 0 {
        return windows;
    }
    let mut start = 0;
    while start + window_size <= utterances.len() {
        windows.push(Window {
            utterances: &utterances[start..start + window_size],
            window_index: windows.len(),
            stride,
            size: window_size,
        });
        start += stride;
    }
    windows
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn utterance(video: &str, seconds: i64, speaker: &str, text: &str) -> Utterance {
        Utterance {
            id: format!("{video}:{seconds}"),
            youtube_video_id: video.to_string(),
            seconds_since_start: seconds,
            timestamp: format!("00:{:02}:{:02}", seconds / 60, seconds % 60),
            speaker_id: speaker.to_string(),
            text: text.to_string(),
        }
    }

    fn numbered(count: usize) -> Vec<Utterance> {
        (0..count)
            .map(|i| {
                utterance(
                    "vid",
                    i as i64 * 10,
                    if i % 2 == 0 { "s_a" } else { "s_b" },
                    &format!("Utterance number {i} is long enough"),
                )
            })
            .collect()
    }

    #[test]
    fn windows_overlap_and_drop_tail() {
        let utterances = numbered(23);
        let refs = prepare_utterances(&utterances, true);
        let windows = build_windows(&refs, 10, 6);

        // starts at 0, 6, 12; 18 + 10 > 23
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[1].utterances[0].id, "vid:60");
        assert_eq!(windows[2].window_index, 2);
        assert!(windows.iter().all(|w| w.utterances.len() == 10));
    }

    #[test]
    fn short_input_yields_no_windows() {
        let utterances = numbered(5);
        let refs = prepare_utterances(&utterances, false);
        assert!(build_windows(&refs, 10, 6).is_empty());
        assert!(build_windows(&refs, 0, 6).is_empty());
        assert!(build_windows(&refs, 2, 0).is_empty());
    }

    #[test]
    fn filter_short_removes_brief_utterances() {
        let utterances = vec![
            utterance("vid", 0, "s_a", "Hear, hear."),
            utterance("vid", 5, "s_b", "The Tax Bill amends the Income Tax Act."),
        ];
        assert_eq!(prepare_utterances(&utterances, true).len(), 1);
        assert_eq!(prepare_utterances(&utterances, false).len(), 2);
    }

    #[test]
    fn window_derived_views() {
        let utterances = vec![
            utterance("vid", 40, "s_b", "Second speaker responds at length."),
            utterance("vid", 20, "s_a", "First speaker opens the debate."),
            utterance("vid", 60, "s_b", "Second speaker again with more."),
        ];
        let refs = prepare_utterances(&utterances, false);
        let window = build_windows(&refs, 3, 3)[0];

        assert_eq!(window.speaker_ids(), vec!["s_b", "s_a"]);
        assert_eq!(window.earliest_seconds(), Some(20));
        assert_eq!(window.earliest_timestamp(), Some("00:00:20"));
        assert_eq!(window.video_id(), "vid");
        assert_eq!(
            window.text().lines().next().unwrap(),
            "[utterance_id=vid:40 t=00:00:40 speaker_id=s_b] Second speaker responds at length."
        );
    }
}
