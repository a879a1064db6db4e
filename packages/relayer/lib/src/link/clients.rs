//! Keeping the two light clients of a link up to date.

use std::time::Duration;

use super::Link;
use crate::{chain::light_client, error::ChainError, height::Height, side::Side};

impl Link {
    /// Updates the counterparty's client of `sender` to the sender's latest header.
    ///
    /// Returns the new trusted height.
    ///
    /// # Errors
    /// Returns an error if the header cannot be built or the update fails.
    #[tracing::instrument(skip_all, fields(%sender))]
    pub async fn update_client(&self, sender: Side) -> Result<Height, ChainError> {
        let (src, dest) = self.get_ends(sender);
        dest.client()
            .update_client_from(dest.client_id(), src.client())
            .await
    }

    /// Updates the counterparty's client of `sender` only if its newest consensus state
    /// is at least `max_age` older than the sender's latest header.
    ///
    /// Returns the new trusted height, or `None` when the client was fresh enough.
    ///
    /// # Errors
    /// Returns an error if a query or the update fails.
    #[tracing::instrument(skip_all, fields(%sender, max_age = ?max_age))]
    pub async fn update_client_if_stale(
        &self,
        sender: Side,
        max_age: Duration,
    ) -> Result<Option<Height>, ChainError> {
        let (src, dest) = self.get_ends(sender);
        let (known, current) = futures::try_join!(
            dest.client().query_consensus_state(dest.client_id(), None),
            src.client().latest_header()
        )?;

        let known_secs = known
            .timestamp
            .as_ref()
            .map_or(0, |ts| light_client::timestamp_nanos(ts) / 1_000_000_000);
        let current_secs = u64::try_from(current.time.unix_timestamp()).unwrap_or_default();
        if known_secs != 0 && known_secs + max_age.as_secs() > current_secs {
            tracing::debug!(known_secs, current_secs, "Client is fresh, skipping update");
            return Ok(None);
        }

        self.update_client(sender).await.map(Some)
    }

    /// Makes sure the counterparty's client of `source` trusts a height of at least
    /// `min_height`, waiting one block on `source` if it has not reached it yet.
    ///
    /// Returns the trusted height.
    ///
    /// # Errors
    /// Returns an error if a query, the wait or the update fails.
    #[tracing::instrument(skip_all, fields(%source, min_height))]
    pub async fn update_client_to_height(
        &self,
        source: Side,
        min_height: u64,
    ) -> Result<Height, ChainError> {
        let (src, dest) = self.get_ends(source);
        let client_state = dest.client().query_client_state(dest.client_id()).await?;
        if let Some(known) = light_client::latest_height(&client_state) {
            if known.revision_height >= min_height {
                tracing::trace!(%known, "Client already trusts height");
                return Ok(known);
            }
        }

        let current = src.client().latest_header().await?.height.value();
        if current < min_height {
            src.client().wait_one_block().await?;
        }
        self.update_client(source).await
    }
}
