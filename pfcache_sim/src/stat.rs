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

impl Stats {
    pub fn push(&mut self, stat: Box<dyn Stat>) {
        self.stats.push(stat)
    }
    pub fn len(&self) -> usize {
        self.stats.len()
    }
    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }
    pub fn view(&self, max_width: usize) -> StatAllView<'_> {
        StatAllView {
            views: self.stats.iter().map(|s| s.view(max_width)).collect(),
        }
    }
}

pub struct StatAllView<'s> {
    views: Vec<Box<dyn StatView + 's>>,
}

impl fmt::Display for StatAllView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .views
            .iter()
            .map(|s| s.header().len().max(s.width()))
            .max()
            .unwrap_or(20);
        writeln!(f, "{:-^width$}", " statistics ")?;
        for sv in &self.views {
            writeln!(f, "{}:", sv.header())?;
            writeln!(f, "{}", sv)?;
        }
        write!(f, "{:-<width$}", "")
    }
}

/// `part` in percent of `total`, formatted to fit an 8 character column
pub fn percent(part: usize, total: usize) -> String {
    if total == 0 {
        return "-".to_string();
    }
    format!("{:.4}", 100. * part as f64 / total as f64)
}

/// Counts of samples falling under each upper bound; the last bucket takes
/// everything above the largest bound.
#[derive(Clone, Debug)]
pub struct Histogram {
    bounds: &'static [usize],
    counts: Vec<usize>,
}

impl Histogram {
    pub fn new(bounds: &'static [usize]) -> Self {
        Self {
            bounds,
            counts: vec![0; bounds.len() + 1],
        }
    }
    pub fn record(&mut self, sample: usize) {
        let bucket = self
            .bounds
            .iter()
            .position(|&b| sample <= b)
            .unwrap_or(self.bounds.len());
        self.counts[bucket] += 1;
    }
    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }
    pub fn counts(&self) -> &[usize] {
        &self.counts
    }

    /// one row per bucket, bars scaled to fit in `max_width` columns
    pub fn rows(&self, max_width: usize) -> impl Iterator<Item = String> + '_ {
        const LABEL: usize = 20;
        let bar_room = max_width.saturating_sub(LABEL).max(1);
        let peak = self.counts.iter().copied().max().unwrap_or(0).max(1);
        self.counts.iter().enumerate().map(move |(i, &count)| {
            let label = match self.bounds.get(i) {
                Some(b) => format!("<= {b}"),
                None => format!("> {}", self.bounds.last().copied().unwrap_or(0)),
            };
            let bar = "#".repeat(count * bar_room / peak);
            format!("  {label:>7}: {count:>8} {bar}")
        })
    }
}
