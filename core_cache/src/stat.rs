use std::fmt;

pub trait Stat {
    fn view(&self, max_width: usize) -> Box<dyn StatView + '_>;
}

pub trait StatView: fmt::Display {
    /// header of stat
    fn header(&self) -> &'static str;
    /// body width
    fn width(&self) -> usize;
}

pub trait AddStats {
    /// add stat to `buf`.
    fn add_stats(&self, buf: &mut Stats);
}

#[derive(Default)]
pub struct Stats {
    stats: Vec<Box<dyn Stat>>,
}

pub struct StatAllView<'s> {
    views: Vec<Box<dyn StatView + 's>>,
}

impl Stats {
    pub fn push(&mut self, stat: Box<dyn Stat>) {
        self.stats.push(stat)
    }
    pub fn view(&self, max_width: usize) -> StatAllView<'_> {
        StatAllView {
            views: self.stats.iter().map(|s| s.view(max_width)).collect(),
        }
    }
}

impl fmt::Display for StatAllView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .views
            .iter()
            .map(|s| s.header().len().max(s.width()))
            .max()
            .unwrap_or(0);
        writeln!(f, "{:-^width$}", " statistics ")?;
        for sv in &self.views {
            writeln!(f, "{}:", sv.header())?;
            writeln!(f, "{}", sv)?;
        }
        write!(f, "{:-<width$}", "")
    }
}

/// `hits / (hits + misses)` in percent. zero when nothing was accessed.
pub fn hit_rate(hits: usize, misses: usize) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 * 100.0 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter(usize);

    impl Stat for Counter {
        fn view(&self, _: usize) -> Box<dyn StatView + '_> {
            Box::new(self)
        }
    }

    impl StatView for &'_ Counter {
        fn header(&self) -> &'static str {
            "counter"
        }
        fn width(&self) -> usize {
            12
        }
    }

    impl fmt::Display for &'_ Counter {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "  count: {:>3}", self.0)
        }
    }

    #[test]
    fn test_view_frames_every_stat() {
        let mut stats = Stats::default();
        stats.push(Box::new(Counter(7)));
        stats.push(Box::new(Counter(42)));
        let rendered = stats.view(80).to_string();
        let lines: Vec<_> = rendered.lines().collect();
        assert_eq!(
            vec![
                " statistics ",
                "counter:",
                "  count:   7",
                "counter:",
                "  count:  42",
                "------------",
            ],
            lines
        );
    }
    #[test]
    fn test_hit_rate() {
        assert_eq!(0.0, hit_rate(0, 0));
        assert_eq!(75.0, hit_rate(3, 1));
    }
}
