use std::future::Future;

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("no acceptable candidate after {attempts} attempts")]
    Exhausted { attempts: usize },

    #[error(transparent)]
    Failed(E),
}

/// Draw candidates from `generate` until `accept` approves one.
///
/// At most `max_attempts` candidates are generated. An error from either
/// closure stops the loop immediately.
pub async fn retry_bounded<T, E, G, GFut, P, PFut>(
    max_attempts: usize,
    mut generate: G,
    mut accept: P,
) -> Result<T, RetryError<E>>
where
    G: FnMut() -> GFut,
    GFut: Future<Output = Result<T, E>>,
    P: FnMut(&T) -> PFut,
    PFut: Future<Output = Result<bool, E>>,
{
    for attempt in 1..=max_attempts {
        let candidate = generate().await.map_err(RetryError::Failed)?;
        if accept(&candidate).await.map_err(RetryError::Failed)? {
            return Ok(candidate);
        }
        tracing::debug!(attempt, max_attempts, "candidate rejected");
    }

    Err(RetryError::Exhausted {
        attempts: max_attempts,
    })
}
