use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

/// Arithmetic operations the calculation service understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Add,
    Subtract,
    Multiply,
    Divide,
    Power,
    Modulus,
}

impl Operation {
    pub const ALL : [Operation; 6] = [
        Operation::Add,
        Operation::Subtract,
        Operation::Multiply,
        Operation::Divide,
        Operation::Power,
        Operation::Modulus,
    ];

    pub fn as_str(&self) -> &'static str {
        use Operation::*;

        match self {
            Add      => "add",
            Subtract => "subtract",
            Multiply => "multiply",
            Divide   => "divide",
            Power    => "power",
            Modulus  => "modulus",
        }
    }

    pub fn symbol(&self) -> &'static str {
        use Operation::*;

        match self {
            Add      => "+",
            Subtract => "-",
            Multiply => "*",
            Divide   => "/",
            Power    => "^",
            Modulus  => "%",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f : &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownOperation(pub String);

impl fmt::Display for UnknownOperation {
    fn fmt(&self, f : &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown operation: {}", self.0)
    }
}

impl std::error::Error for UnknownOperation {}

/// Accepts both the wire name (`add`) and the symbol (`+`).
impl FromStr for Operation {
    type Err = UnknownOperation;

    fn from_str(s : &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Operation::ALL
            .iter()
            .copied()
            .find(|op| s.eq_ignore_ascii_case(op.as_str()) || s == op.symbol())
            .ok_or_else(|| UnknownOperation(s.to_string()))
    }
}

/// The logged in user, as returned by `/auth/me` and the profile endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub username : String,
    pub email : String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id : Option<i64>,

    #[serde(default, with = "timestamp::option", skip_serializing_if = "Option::is_none")]
    pub created_at : Option<DateTime<Utc>>,

    #[serde(default, with = "timestamp::option", skip_serializing_if = "Option::is_none")]
    pub updated_at : Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewUser {
    pub username : String,
    pub email : String,
    pub password : String,
}

/// Partial profile update, absent fields are left unchanged by the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username : Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email : Option<String>,
}

/// A stored calculation. Display only, the server owns these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calculation {
    pub id : i64,
    pub user_id : i64,
    pub operation : Operation,
    pub operand1 : f64,
    pub operand2 : f64,
    pub result : f64,
    #[serde(with = "timestamp")]
    pub created_at : DateTime<Utc>,
}

/// Response of a calculation submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationResult {
    pub operation : Operation,
    pub operand1 : f64,
    pub operand2 : f64,
    pub result : f64,
    #[serde(default)]
    pub message : String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CalculationUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation : Option<Operation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operand1 : Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operand2 : Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationStats {
    pub operation : String,
    pub count : u64,
    pub percentage : f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsSummary {
    pub total_calculations : u64,
    #[serde(default = "one")]
    pub total_users : u64,
    #[serde(default)]
    pub operations_breakdown : Vec<OperationStats>,
    #[serde(default)]
    pub most_used_operation : Option<String>,
    #[serde(default)]
    pub average_result : Option<f64>,
    #[serde(default, with = "timestamp::option")]
    pub latest_calculation : Option<DateTime<Utc>>,
}

fn one() -> u64 {
    1
}

/// One page of `/analytics/history`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryPage {
    pub items : Vec<Calculation>,
    pub total : u64,
    pub limit : u64,
    #[serde(default)]
    pub offset : u64,
    pub has_more : bool,
}

impl HistoryPage {
    /// Zero based index of this page.
    pub fn page(&self) -> u64 {
        if self.limit == 0 {
            return 0
        }

        self.offset / self.limit
    }

    pub fn page_count(&self) -> u64 {
        if self.limit == 0 {
            return 0
        }

        self.total / self.limit + (self.total % self.limit != 0) as u64
    }

    pub fn has_previous(&self) -> bool {
        self.offset > 0
    }
}

pub const DEFAULT_HISTORY_LIMIT : u64 = 10;
pub const MAX_HISTORY_LIMIT : u64 = 100;

/// Query for `/analytics/history`. The server rejects limits outside
/// `1..=100`, so the setters clamp.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryFilter {
    pub operation : Option<Operation>,
    pub start_date : Option<DateTime<Utc>>,
    pub end_date : Option<DateTime<Utc>>,
    pub limit : u64,
    pub offset : u64,
}

impl Default for HistoryFilter {
    fn default() -> Self {
        Self {
            operation : None,
            start_date : None,
            end_date : None,
            limit : DEFAULT_HISTORY_LIMIT,
            offset : 0,
        }
    }
}

impl HistoryFilter {
    pub fn limit(mut self, limit : u64) -> Self {
        self.limit = limit.max(1).min(MAX_HISTORY_LIMIT);
        self
    }

    /// Moves to the zero based `page` at the current limit.
    pub fn page(mut self, page : u64) -> Self {
        self.offset = page.saturating_mul(self.limit);
        self
    }

    pub fn operation(mut self, op : Operation) -> Self {
        self.operation = Some(op);
        self
    }

    pub fn between(
        mut self,
        start : Option<DateTime<Utc>>,
        end : Option<DateTime<Utc>>,
    ) -> Self {
        self.start_date = start;
        self.end_date = end;
        self
    }

    pub fn to_query(&self) -> String {
        let mut query = format!("limit={}&offset={}", self.limit, self.offset);

        if let Some(op) = self.operation {
            query.push_str("&operation=");
            query.push_str(op.as_str());
        }

        let dates = [("start_date", &self.start_date), ("end_date", &self.end_date)];
        for (key, date) in dates.iter() {
            if let Some(date) = date {
                let s = date.to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
                query.push_str(&format!("&{}={}", key, urlencoding::encode(&s)));
            }
        }

        query
    }
}

/// The backend emits naive ISO 8601 timestamps (implicitly UTC), but RFC 3339
/// with an offset is accepted as well.
pub mod timestamp {
    use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn parse(s : &str) -> Result<DateTime<Utc>, chrono::ParseError> {
        match DateTime::parse_from_rfc3339(s) {
            Ok(t) => Ok(t.with_timezone(&Utc)),
            Err(_) => NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                .map(|t| Utc.from_utc_datetime(&t)),
        }
    }

    pub fn serialize<S>(t : &DateTime<Utc>, s : S) -> Result<S::Ok, S::Error>
    where
        S : Serializer,
    {
        s.serialize_str(&t.to_rfc3339())
    }

    pub fn deserialize<'de, D>(d : D) -> Result<DateTime<Utc>, D::Error>
    where
        D : Deserializer<'de>,
    {
        let s = String::deserialize(d)?;
        parse(&s).map_err(de::Error::custom)
    }

    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{de, Deserialize, Deserializer, Serializer};

        pub fn serialize<S>(t : &Option<DateTime<Utc>>, s : S) -> Result<S::Ok, S::Error>
        where
            S : Serializer,
        {
            match t {
                Some(t) => super::serialize(t, s),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(d : D) -> Result<Option<DateTime<Utc>>, D::Error>
        where
            D : Deserializer<'de>,
        {
            Option::<String>::deserialize(d)?
                .map(|s| super::parse(&s).map_err(de::Error::custom))
                .transpose()
        }
    }
}
