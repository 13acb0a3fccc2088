use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle of a `news_summaries` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryStatus {
    Pending,
    PendingBeijingGate,
    PendingExternalFilter,
    ReadyForExport,
    FilteredOut,
    Failed,
}

impl SummaryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SummaryStatus::Pending => "pending",
            SummaryStatus::PendingBeijingGate => "pending_beijing_gate",
            SummaryStatus::PendingExternalFilter => "pending_external_filter",
            SummaryStatus::ReadyForExport => "ready_for_export",
            SummaryStatus::FilteredOut => "filtered_out",
            SummaryStatus::Failed => "failed",
        }
    }

    /// Terminal for automatic processing; only reviewers act on rows past this point.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SummaryStatus::ReadyForExport | SummaryStatus::FilteredOut | SummaryStatus::Failed
        )
    }
}

impl fmt::Display for SummaryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SummaryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SummaryStatus::Pending),
            "pending_beijing_gate" => Ok(SummaryStatus::PendingBeijingGate),
            "pending_external_filter" => Ok(SummaryStatus::PendingExternalFilter),
            "ready_for_export" => Ok(SummaryStatus::ReadyForExport),
            "filtered_out" => Ok(SummaryStatus::FilteredOut),
            "failed" => Ok(SummaryStatus::Failed),
            other => Err(format!("unknown summary status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Region {
    Beijing,
    External,
}

impl Region {
    pub fn as_str(&self) -> &'static str {
        match self {
            Region::Beijing => "beijing",
            Region::External => "external",
        }
    }

    pub fn from_flag(is_beijing_related: bool) -> Self {
        if is_beijing_related {
            Region::Beijing
        } else {
            Region::External
        }
    }
}

impl FromStr for Region {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "beijing" => Ok(Region::Beijing),
            "external" => Ok(Region::External),
            other => Err(format!("unknown region: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Negative,
}

impl Sentiment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sentiment::Positive => "positive",
            Sentiment::Negative => "negative",
        }
    }
}

impl FromStr for Sentiment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "positive" => Ok(Sentiment::Positive),
            "negative" => Ok(Sentiment::Negative),
            other => Err(format!("unknown sentiment: {}", other)),
        }
    }
}

/// Region × sentiment. Selects the importance prompt/threshold and names a review bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Category {
    pub region: Region,
    pub sentiment: Sentiment,
}

impl Category {
    pub fn new(region: Region, sentiment: Sentiment) -> Self {
        Self { region, sentiment }
    }

    /// The four fixed buckets, in display order.
    pub fn all() -> [Category; 4] {
        [
            Category::new(Region::Beijing, Sentiment::Positive),
            Category::new(Region::Beijing, Sentiment::Negative),
            Category::new(Region::External, Sentiment::Positive),
            Category::new(Region::External, Sentiment::Negative),
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match (self.region, self.sentiment) {
            (Region::Beijing, Sentiment::Positive) => "beijing_positive",
            (Region::Beijing, Sentiment::Negative) => "beijing_negative",
            (Region::External, Sentiment::Positive) => "external_positive",
            (Region::External, Sentiment::Negative) => "external_negative",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (region, sentiment) = s
            .split_once('_')
            .ok_or_else(|| format!("unknown category: {}", s))?;
        Ok(Category::new(region.parse()?, sentiment.parse()?))
    }
}
