use crate::model::{Regression, RowId};
use crate::storage::SuiteConn;

pub const TITLE_MAX_CHARS: usize = 120;
pub const TITLE_ELLIPSIS: &str = "...";

/// Display name of a test: the last `/` segment.
pub fn short_name(test_name: &str) -> &str {
    test_name.rsplit('/').next().unwrap_or(test_name)
}

/// `Regression of {n} benchmarks: {names}`, cropped to 120 characters plus an
/// ellipsis. `names` are kept in the given order with repeats dropped.
pub fn format_title<'a, I>(indicator_count: usize, names: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut distinct: Vec<&str> = Vec::new();
    for n in names {
        if !distinct.contains(&n) {
            distinct.push(n);
        }
    }
    let title = format!(
        "Regression of {} benchmarks: {}",
        indicator_count,
        distinct.join(", ")
    );
    if title.chars().count() > TITLE_MAX_CHARS {
        let cropped: String = title.chars().take(TITLE_MAX_CHARS).collect();
        format!("{}{}", cropped, TITLE_ELLIPSIS)
    } else {
        title
    }
}

impl SuiteConn<'_> {
    /// Title derived from the regression's current indicators.
    pub fn derived_title(&self, regression_id: RowId) -> anyhow::Result<String> {
        let changes = self.regression_changes(regression_id, true)?;
        let mut names = Vec::with_capacity(changes.len());
        for fc in &changes {
            names.push(self.get_test(fc.test_id)?.name);
        }
        Ok(format_title(changes.len(), names.iter().map(|n| short_name(n))))
    }

    /// Recomputes an auto-titled regression's title. Hand-written titles are
    /// left alone. Returns the regression as stored.
    pub fn rebuild_title(&self, regression_id: RowId) -> anyhow::Result<Regression> {
        let mut r = self.get_regression(regression_id)?;
        if !r.auto_title {
            return Ok(r);
        }
        let title = self.derived_title(regression_id)?;
        if title != r.title {
            r.title = title;
            self.save_regression(&r)?;
        }
        Ok(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_names_drop_path() {
        assert_eq!(short_name("SingleSource/Benchmarks/foo"), "foo");
        assert_eq!(short_name("bar"), "bar");
    }

    #[test]
    fn titles_count_indicators_and_dedup_names() {
        assert_eq!(format_title(1, ["A"]), "Regression of 1 benchmarks: A");
        assert_eq!(format_title(3, ["A", "B", "A"]), "Regression of 3 benchmarks: A, B");
    }

    #[test]
    fn long_titles_are_cropped() {
        let names: Vec<String> = (0..40).map(|i| format!("bench{}", i)).collect();
        let title = format_title(40, names.iter().map(|s| s.as_str()));
        assert_eq!(title.chars().count(), TITLE_MAX_CHARS + TITLE_ELLIPSIS.len());
        assert!(title.ends_with("..."));
        assert!(title.starts_with("Regression of 40 benchmarks: bench0, bench1"));
    }
}
