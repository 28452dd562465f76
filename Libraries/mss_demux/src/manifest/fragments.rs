//! Back-fill of fragment numbers, start times and durations left implicit by the document.

use tracing::warn;

use crate::manifest::{Fragment, FragmentNode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BuiltFragment {
    pub fragment: Fragment,
    /// The document carried an `n` attribute for this fragment.
    pub explicit_number: bool,
}

#[derive(Debug, Default)]
pub(crate) struct FragmentListBuilder {
    fragments: Vec<BuiltFragment>,
    next_number: u64,
    accumulated_time: u64,
    /// Fragment still waiting for its duration, taken from the next fragment's start.
    pending: Option<usize>,
}

impl FragmentListBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continues numbering and timing after `last`, used when merging a reloaded list.
    pub fn seeded(last: &Fragment) -> Self {
        Self {
            next_number: last.number.saturating_add(1),
            accumulated_time: last.end().unwrap_or(last.time),
            ..Self::default()
        }
    }

    pub fn add(&mut self, node: &FragmentNode) {
        let repeat = match (node.duration, node.repeat) {
            (Some(_), Some(repeat)) if repeat > 1 => repeat,
            _ => 1,
        };

        self.push(node.number, node.time, node.duration);
        for _ in 1..repeat {
            self.push(None, None, node.duration);
        }
    }

    fn push(&mut self, number: Option<u64>, time: Option<u64>, duration: Option<u64>) {
        let explicit_number = number.is_some();
        let number = number.unwrap_or(self.next_number);
        self.next_number = number.saturating_add(1);

        let time = match time {
            Some(time) => {
                self.accumulated_time = time;
                time
            }
            None => self.accumulated_time,
        };

        if let Some(last) = self.fragments.last() {
            if time < last.fragment.time {
                warn!(
                    "Dropping fragment {} starting at {} before its predecessor at {}",
                    number, time, last.fragment.time
                );
                return;
            }
        }

        if let Some(index) = self.pending.take() {
            let pending = &mut self.fragments[index].fragment;
            pending.duration = Some(time - pending.time);
        }

        match duration {
            Some(duration) => self.accumulated_time = time.saturating_add(duration),
            None => self.pending = Some(self.fragments.len()),
        }

        self.fragments.push(BuiltFragment {
            fragment: Fragment { number, time, duration },
            explicit_number,
        });
    }

    pub fn finish(self) -> Vec<BuiltFragment> {
        self.fragments
    }

    pub fn build(self) -> Vec<Fragment> {
        self.fragments.into_iter().map(|built| built.fragment).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(nodes: &[FragmentNode]) -> Vec<Fragment> {
        let mut builder = FragmentListBuilder::new();
        for node in nodes {
            builder.add(node);
        }
        builder.build()
    }

    fn fragment(number: u64, time: u64, duration: Option<u64>) -> Fragment {
        Fragment { number, time, duration }
    }

    #[test]
    fn back_fills_numbers_times_and_durations() {
        let fragments = build(&[
            FragmentNode::new().number(0).time(0).duration(1000),
            FragmentNode::new().duration(2000),
            FragmentNode::new().time(3000),
        ]);

        assert_eq!(
            fragments,
            vec![fragment(0, 0, Some(1000)), fragment(1, 1000, Some(2000)), fragment(2, 3000, None)]
        );
    }

    #[test]
    fn pending_duration_comes_from_next_start() {
        let fragments = build(&[FragmentNode::new().time(100), FragmentNode::new().time(350).duration(50)]);
        assert_eq!(fragments, vec![fragment(0, 100, Some(250)), fragment(1, 350, Some(50))]);
    }

    #[test]
    fn explicit_numbers_restart_the_sequence() {
        let fragments = build(&[
            FragmentNode::new().number(10).duration(5),
            FragmentNode::new().duration(5),
            FragmentNode::new().number(40).duration(5),
            FragmentNode::new().duration(5),
        ]);
        let numbers = fragments.iter().map(|f| f.number).collect::<Vec<_>>();
        assert_eq!(numbers, vec![10, 11, 40, 41]);
    }

    #[test]
    fn repeat_expands_fragments_with_known_duration() {
        let fragments = build(&[FragmentNode::new().time(0).duration(10).repeat(3), FragmentNode::new().duration(7)]);
        let times = fragments.iter().map(|f| f.time).collect::<Vec<_>>();
        assert_eq!(times, vec![0, 10, 20, 30]);
        assert_eq!(fragments[3].duration, Some(7));
    }

    #[test]
    fn repeat_without_duration_is_ignored() {
        let fragments = build(&[FragmentNode::new().time(0).repeat(4)]);
        assert_eq!(fragments, vec![fragment(0, 0, None)]);
    }

    #[test]
    fn seeded_builder_continues_after_last_fragment() {
        let mut builder = FragmentListBuilder::seeded(&fragment(4, 400, Some(100)));
        builder.add(&FragmentNode::new().duration(100));
        let built = builder.finish();
        assert_eq!(built[0].fragment, fragment(5, 500, Some(100)));
        assert!(!built[0].explicit_number);
    }

    #[test]
    fn drops_fragments_going_back_in_time() {
        let fragments = build(&[FragmentNode::new().time(100).duration(10), FragmentNode::new().time(50)]);
        assert_eq!(fragments, vec![fragment(0, 100, Some(10))]);
    }
}
