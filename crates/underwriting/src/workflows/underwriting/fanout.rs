use std::future::Future;

use futures::future::join_all;

/// Run independent lookups concurrently and wait for every one of them.
///
/// Results come back in launch order. If any lookup fails, the first error in launch
/// order is returned; the remaining errors are dropped, but no lookup is left running
/// once this returns.
pub async fn fetch_all<T, E, F>(lookups: Vec<F>) -> Result<Vec<T>, E>
where
    F: Future<Output = Result<T, E>>,
{
    let results = join_all(lookups).await;

    let mut values = Vec::with_capacity(results.len());
    for result in results {
        values.push(result?);
    }
    Ok(values)
}
