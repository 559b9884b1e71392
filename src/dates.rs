use crate::error::{CoreError, Result};
use chrono::{Datelike, Days, NaiveDate};

pub fn last_day_of_month(year: i32, month: u32) -> NaiveDate {
    let next_month = if month == 12 { 1 } else { month + 1 };
    let next_year = if month == 12 { year + 1 } else { year };

    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .unwrap()
        .checked_sub_days(Days::new(1))
        .unwrap()
}

/// A parsed `period_spec` as accepted by `Store::aggregate_period` and the
/// `/financial-data/{period}` surface: a year (`YYYY`), quarter (`YYYY-Qn`),
/// month (`YYYY-MM`), or single date (`YYYY-MM-DD`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodSpec {
    Year(i32),
    Quarter(i32, u32),
    Month(i32, u32),
    Day(NaiveDate),
}

impl PeriodSpec {
    pub fn parse(raw: &str) -> Result<PeriodSpec> {
        let raw = raw.trim();

        if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
            return Ok(PeriodSpec::Day(date));
        }

        if let Some((y, q)) = raw.split_once("-Q") {
            let year: i32 = y
                .parse()
                .map_err(|_| CoreError::ValidationError(format!("invalid period year: {raw}")))?;
            let quarter: u32 = q
                .parse()
                .map_err(|_| CoreError::ValidationError(format!("invalid quarter: {raw}")))?;
            if !(1..=4).contains(&quarter) {
                return Err(CoreError::ValidationError(format!(
                    "quarter must be 1..=4, got {quarter}"
                )));
            }
            return Ok(PeriodSpec::Quarter(year, quarter));
        }

        if let Some((y, m)) = raw.split_once('-') {
            let year: i32 = y
                .parse()
                .map_err(|_| CoreError::ValidationError(format!("invalid period year: {raw}")))?;
            let month: u32 = m
                .parse()
                .map_err(|_| CoreError::ValidationError(format!("invalid month: {raw}")))?;
            if !(1..=12).contains(&month) {
                return Err(CoreError::ValidationError(format!(
                    "month must be 1..=12, got {month}"
                )));
            }
            return Ok(PeriodSpec::Month(year, month));
        }

        let year: i32 = raw
            .parse()
            .map_err(|_| CoreError::ValidationError(format!("unrecognized period: {raw}")))?;
        Ok(PeriodSpec::Year(year))
    }

    /// The inclusive `[start, end]` date range this spec denotes.
    pub fn date_range(&self) -> (NaiveDate, NaiveDate) {
        match *self {
            PeriodSpec::Day(d) => (d, d),
            PeriodSpec::Month(year, month) => (
                NaiveDate::from_ymd_opt(year, month, 1).unwrap(),
                last_day_of_month(year, month),
            ),
            PeriodSpec::Quarter(year, quarter) => {
                let start_month = (quarter - 1) * 3 + 1;
                let end_month = start_month + 2;
                (
                    NaiveDate::from_ymd_opt(year, start_month, 1).unwrap(),
                    last_day_of_month(year, end_month),
                )
            }
            PeriodSpec::Year(year) => (
                NaiveDate::from_ymd_opt(year, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(year, 12, 31).unwrap(),
            ),
        }
    }

    pub fn label(&self) -> String {
        match *self {
            PeriodSpec::Day(d) => d.format("%Y-%m-%d").to_string(),
            PeriodSpec::Month(y, m) => format!("{y:04}-{m:02}"),
            PeriodSpec::Quarter(y, q) => format!("{y:04}-Q{q}"),
            PeriodSpec::Year(y) => format!("{y:04}"),
        }
    }
}

pub fn today() -> NaiveDate {
    chrono::Utc::now().date_naive()
}

pub fn years_ago(date: NaiveDate, years: i32) -> NaiveDate {
    NaiveDate::from_ymd_opt(date.year() - years, date.month(), date.day())
        .unwrap_or(date)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_period_shapes() {
        assert_eq!(PeriodSpec::parse("2024").unwrap(), PeriodSpec::Year(2024));
        assert_eq!(
            PeriodSpec::parse("2024-Q2").unwrap(),
            PeriodSpec::Quarter(2024, 2)
        );
        assert_eq!(
            PeriodSpec::parse("2024-05").unwrap(),
            PeriodSpec::Month(2024, 5)
        );
        assert_eq!(
            PeriodSpec::parse("2024-05-17").unwrap(),
            PeriodSpec::Day(NaiveDate::from_ymd_opt(2024, 5, 17).unwrap())
        );
    }

    #[test]
    fn quarter_range_covers_three_months() {
        let spec = PeriodSpec::parse("2024-Q2").unwrap();
        let (start, end) = spec.date_range();
        assert_eq!(start, NaiveDate::from_ymd_opt(2024, 4, 1).unwrap());
        assert_eq!(end, NaiveDate::from_ymd_opt(2024, 6, 30).unwrap());
    }

    #[test]
    fn rejects_bad_quarter() {
        assert!(PeriodSpec::parse("2024-Q5").is_err());
    }
}
