//! QUERY: records changed in `(from, to]`.
//!
//! The fstat service is asked first when one is configured. A redirect to R
//! is completed with a depot query for `(R, to]`; a miss or an unreachable
//! service sends the whole range to the depot.

use crate::depot::{latest_per_path, Depot};
use crate::record::FstatRecord;
use crate::server::store::Lookup;
use crate::transport::ServiceClient;
use anyhow::Result;

/// Where the records of a query came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuerySource {
    Depot,
    Service,
    Redirect { redirect_to: u64 },
}

#[derive(Debug, Clone)]
pub struct QueryResult {
    pub records: Vec<FstatRecord>,
    pub source: QuerySource,
}

pub async fn query_range(
    depot: &dyn Depot,
    service: Option<&ServiceClient>,
    prefix: &str,
    from: u64,
    to: u64,
) -> Result<QueryResult> {
    if from >= to {
        return Ok(QueryResult {
            records: Vec::new(),
            source: QuerySource::Depot,
        });
    }

    let answer = match service {
        Some(client) => client.query(prefix, from, to).await?,
        None => None,
    };

    let result = match answer {
        Some(Lookup::Full(records)) => QueryResult {
            records: latest_per_path(records, from, to),
            source: QuerySource::Service,
        },
        Some(Lookup::Redirect {
            redirect_to,
            records,
        }) => {
            let rest = depot.fstat(prefix, redirect_to, to).await?;
            tracing::info!(
                prefix,
                from,
                to,
                redirect_to,
                cached = records.len(),
                direct = rest.len(),
                "fstat service redirected"
            );
            QueryResult {
                records: merge_newer(records, rest, from, to),
                source: QuerySource::Redirect { redirect_to },
            }
        }
        Some(Lookup::Miss) | None => QueryResult {
            records: depot.fstat(prefix, from, to).await?,
            source: QuerySource::Depot,
        },
    };
    tracing::debug!(prefix, from, to, records = result.records.len(), "query done");
    Ok(result)
}

/// Union of two record sets, one record per path, the newer change winning.
pub fn merge_newer(
    older: Vec<FstatRecord>,
    newer: Vec<FstatRecord>,
    from: u64,
    to: u64,
) -> Vec<FstatRecord> {
    latest_per_path(older.into_iter().chain(newer), from, to)
}
