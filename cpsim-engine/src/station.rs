//! Charge-point state machine
//!
//! Pure connector/transaction state, no I/O. The session layer drives it
//! and turns the returned status changes into StatusNotification calls.
//!
//! Guards enforced here, before anything touches the wire:
//! - StartTransaction only from `Preparing`
//! - StopTransaction only with an Active transaction
//! - ChangeAvailability(Inoperative) during a transaction is deferred and
//!   reported as `Scheduled`

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::types::{
    AvailabilityStatus, AvailabilityType, ChargePointErrorCode, ChargePointStatus, Reason,
};

/// Local operation failures, raised before any frame is sent
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StationError {
    #[error("unknown connector {0}")]
    UnknownConnector(u32),

    #[error("connector {connector_id} is {status}, cannot {operation}")]
    InvalidState {
        connector_id: u32,
        status: ChargePointStatus,
        operation: &'static str,
    },

    #[error("no active transaction on connector {0}")]
    NoActiveTransaction(u32),
}

/// Transaction lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// StartTransaction sent, id not yet confirmed by the CSMS
    Pending,
    /// Id confirmed, energy flowing
    Active,
    /// StopTransaction acknowledged
    Closed,
    /// Connection dropped before the stop was acknowledged; queued for resend
    ClosedUnconfirmed,
}

/// One charging transaction
#[derive(Debug, Clone)]
pub struct Transaction {
    /// Assigned by the CSMS in the StartTransaction response
    pub id: Option<i64>,
    pub connector_id: u32,
    pub id_tag: String,
    pub meter_start: i64,
    pub started_at: DateTime<Utc>,
    pub state: TransactionState,
    pub meter_stop: Option<i64>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub stop_reason: Option<Reason>,
}

/// One physical socket
#[derive(Debug, Clone)]
pub struct Connector {
    pub id: u32,
    pub status: ChargePointStatus,
    pub error_code: ChargePointErrorCode,
    /// ChangeAvailability(Inoperative) received mid-transaction
    pub inoperative_pending: bool,
    /// Cumulative energy register in Wh, carried across transactions
    pub meter_wh: i64,
    transaction: Option<Transaction>,
}

impl Connector {
    fn new(id: u32) -> Self {
        Self {
            id,
            status: ChargePointStatus::Available,
            error_code: ChargePointErrorCode::NoError,
            inoperative_pending: false,
            meter_wh: 0,
            transaction: None,
        }
    }

    pub fn transaction(&self) -> Option<&Transaction> {
        self.transaction.as_ref()
    }
}

/// A status transition the caller should report via StatusNotification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub connector_id: u32,
    pub status: ChargePointStatus,
    pub error_code: ChargePointErrorCode,
}

/// Connector and transaction state for one charge point
#[derive(Debug)]
pub struct Station {
    connectors: BTreeMap<u32, Connector>,
    /// Transactions whose stop was never acknowledged, kept for resend
    unconfirmed: Vec<Transaction>,
}

impl Station {
    pub fn new(connector_count: u32) -> Self {
        let connectors = (1..=connector_count)
            .map(|id| (id, Connector::new(id)))
            .collect();
        Self {
            connectors,
            unconfirmed: Vec::new(),
        }
    }

    pub fn connector_count(&self) -> u32 {
        self.connectors.len() as u32
    }

    pub fn connector(&self, id: u32) -> Result<&Connector, StationError> {
        self.connectors
            .get(&id)
            .ok_or(StationError::UnknownConnector(id))
    }

    fn connector_mut(&mut self, id: u32) -> Result<&mut Connector, StationError> {
        self.connectors
            .get_mut(&id)
            .ok_or(StationError::UnknownConnector(id))
    }

    pub fn connectors(&self) -> impl Iterator<Item = &Connector> {
        self.connectors.values()
    }

    /// Current status of every connector, for the post-boot notification sweep.
    pub fn status_changes(&self) -> Vec<StatusChange> {
        self.connectors
            .values()
            .map(|c| StatusChange {
                connector_id: c.id,
                status: c.status,
                error_code: c.error_code,
            })
            .collect()
    }

    /// Cable plug-in: `Available -> Preparing`.
    ///
    /// Returns the status change, or `None` when already in `Preparing`.
    pub fn plug_in(&mut self, id: u32) -> Result<Option<StatusChange>, StationError> {
        let connector = self.connector_mut(id)?;
        match connector.status {
            ChargePointStatus::Available => {
                connector.status = ChargePointStatus::Preparing;
                Ok(Some(StatusChange {
                    connector_id: id,
                    status: ChargePointStatus::Preparing,
                    error_code: connector.error_code,
                }))
            }
            ChargePointStatus::Preparing => Ok(None),
            status => Err(StationError::InvalidState {
                connector_id: id,
                status,
                operation: "plug in",
            }),
        }
    }

    /// Record a StartTransaction about to be sent. Requires `Preparing`.
    ///
    /// The connector's cumulative register supplies meterStart, which is
    /// returned for the outgoing call.
    pub fn start_pending(
        &mut self,
        id: u32,
        id_tag: &str,
        started_at: DateTime<Utc>,
    ) -> Result<i64, StationError> {
        let connector = self.connector_mut(id)?;
        if connector.status != ChargePointStatus::Preparing || connector.transaction.is_some() {
            return Err(StationError::InvalidState {
                connector_id: id,
                status: connector.status,
                operation: "start transaction",
            });
        }

        let meter_start = connector.meter_wh;
        connector.transaction = Some(Transaction {
            id: None,
            connector_id: id,
            id_tag: id_tag.to_string(),
            meter_start,
            started_at,
            state: TransactionState::Pending,
            meter_stop: None,
            stopped_at: None,
            stop_reason: None,
        });
        Ok(meter_start)
    }

    /// CSMS accepted the StartTransaction: `Preparing -> Charging`.
    pub fn confirm_start(
        &mut self,
        id: u32,
        transaction_id: i64,
    ) -> Result<StatusChange, StationError> {
        let connector = self.connector_mut(id)?;
        let Some(transaction) = connector.transaction.as_mut() else {
            return Err(StationError::NoActiveTransaction(id));
        };

        transaction.id = Some(transaction_id);
        transaction.state = TransactionState::Active;
        connector.status = ChargePointStatus::Charging;

        Ok(StatusChange {
            connector_id: id,
            status: ChargePointStatus::Charging,
            error_code: connector.error_code,
        })
    }

    /// CSMS rejected the StartTransaction: `Preparing -> Available`.
    pub fn reject_start(&mut self, id: u32) -> Result<StatusChange, StationError> {
        let connector = self.connector_mut(id)?;
        connector.transaction = None;
        connector.status = ChargePointStatus::Available;

        Ok(StatusChange {
            connector_id: id,
            status: ChargePointStatus::Available,
            error_code: connector.error_code,
        })
    }

    /// Transaction on a connector, if any.
    pub fn active_transaction(&self, id: u32) -> Option<&Transaction> {
        self.connectors
            .get(&id)
            .and_then(|c| c.transaction.as_ref())
            .filter(|t| t.state == TransactionState::Active)
    }

    /// Connector holding the transaction with this CSMS-assigned id.
    pub fn connector_of_transaction(&self, transaction_id: i64) -> Option<u32> {
        self.connectors
            .values()
            .find(|c| {
                c.transaction
                    .as_ref()
                    .is_some_and(|t| t.id == Some(transaction_id))
            })
            .map(|c| c.id)
    }

    /// Begin stopping: `Charging -> Finishing`, stop fields recorded.
    ///
    /// Returns a snapshot to build the StopTransaction call from; the
    /// transaction itself stays on the connector until acknowledged.
    pub fn begin_stop(
        &mut self,
        id: u32,
        meter_stop: i64,
        stopped_at: DateTime<Utc>,
        reason: Reason,
    ) -> Result<(Transaction, StatusChange), StationError> {
        let connector = self.connector_mut(id)?;
        let Some(transaction) = connector
            .transaction
            .as_mut()
            .filter(|t| t.state == TransactionState::Active)
        else {
            return Err(StationError::NoActiveTransaction(id));
        };

        transaction.meter_stop = Some(meter_stop);
        transaction.stopped_at = Some(stopped_at);
        transaction.stop_reason = Some(reason);
        let snapshot = transaction.clone();

        connector.status = ChargePointStatus::Finishing;

        Ok((
            snapshot,
            StatusChange {
                connector_id: id,
                status: ChargePointStatus::Finishing,
                error_code: connector.error_code,
            },
        ))
    }

    /// StopTransaction acknowledged: `Finishing -> Available`, or straight
    /// to `Unavailable` when a ChangeAvailability was deferred.
    pub fn finish_stop(&mut self, id: u32) -> Result<StatusChange, StationError> {
        let connector = self.connector_mut(id)?;
        if let Some(mut transaction) = connector.transaction.take() {
            transaction.state = TransactionState::Closed;
            if let Some(meter_stop) = transaction.meter_stop {
                connector.meter_wh = meter_stop;
            }
        }

        connector.status = if connector.inoperative_pending {
            connector.inoperative_pending = false;
            ChargePointStatus::Unavailable
        } else {
            ChargePointStatus::Available
        };

        Ok(StatusChange {
            connector_id: id,
            status: connector.status,
            error_code: connector.error_code,
        })
    }

    /// Simulated fault injection: any state to `Faulted`.
    pub fn fault(
        &mut self,
        id: u32,
        error_code: ChargePointErrorCode,
    ) -> Result<StatusChange, StationError> {
        let connector = self.connector_mut(id)?;
        connector.status = ChargePointStatus::Faulted;
        connector.error_code = error_code;

        Ok(StatusChange {
            connector_id: id,
            status: ChargePointStatus::Faulted,
            error_code,
        })
    }

    /// Operator override of connector status.
    pub fn set_status(
        &mut self,
        id: u32,
        status: ChargePointStatus,
        error_code: ChargePointErrorCode,
    ) -> Result<StatusChange, StationError> {
        let connector = self.connector_mut(id)?;
        connector.status = status;
        connector.error_code = error_code;

        Ok(StatusChange {
            connector_id: id,
            status,
            error_code,
        })
    }

    /// Apply ChangeAvailability to one connector.
    ///
    /// Inoperative with an active transaction is deferred: the connector
    /// keeps charging and the change is applied when the transaction ends.
    pub fn change_availability(
        &mut self,
        id: u32,
        kind: AvailabilityType,
    ) -> Result<(AvailabilityStatus, Option<StatusChange>), StationError> {
        let has_transaction = self.active_transaction(id).is_some();
        let connector = self.connector_mut(id)?;

        match kind {
            AvailabilityType::Inoperative => {
                if has_transaction {
                    connector.inoperative_pending = true;
                    Ok((AvailabilityStatus::Scheduled, None))
                } else {
                    connector.status = ChargePointStatus::Unavailable;
                    Ok((
                        AvailabilityStatus::Accepted,
                        Some(StatusChange {
                            connector_id: id,
                            status: ChargePointStatus::Unavailable,
                            error_code: connector.error_code,
                        }),
                    ))
                }
            }
            AvailabilityType::Operative => {
                connector.inoperative_pending = false;
                if connector.status == ChargePointStatus::Unavailable {
                    connector.status = ChargePointStatus::Available;
                    Ok((
                        AvailabilityStatus::Accepted,
                        Some(StatusChange {
                            connector_id: id,
                            status: ChargePointStatus::Available,
                            error_code: connector.error_code,
                        }),
                    ))
                } else {
                    Ok((AvailabilityStatus::Accepted, None))
                }
            }
        }
    }

    /// Connection dropped: move every live transaction to the unconfirmed
    /// queue so its StopTransaction can be resent after reconnect.
    ///
    /// `meter_stop_of` supplies the final register value per transaction.
    pub fn close_unconfirmed(
        &mut self,
        reason: Reason,
        mut meter_stop_of: impl FnMut(&Transaction) -> i64,
    ) {
        let now = Utc::now();
        for connector in self.connectors.values_mut() {
            let live = connector
                .transaction
                .as_ref()
                .is_some_and(|t| t.state == TransactionState::Active);
            if !live {
                // a Pending start that was never confirmed is simply dropped
                if connector.transaction.take().is_some() {
                    connector.status = ChargePointStatus::Available;
                }
                continue;
            }
            if let Some(mut transaction) = connector.transaction.take() {
                transaction.state = TransactionState::ClosedUnconfirmed;
                let meter_stop = meter_stop_of(&transaction);
                transaction.meter_stop = Some(meter_stop);
                transaction.stopped_at = Some(now);
                transaction.stop_reason = Some(reason);
                self.unconfirmed.push(transaction);

                connector.meter_wh = meter_stop;
                connector.status = ChargePointStatus::Available;
            }
        }
    }

    /// Drain the unconfirmed-stop queue.
    pub fn take_unconfirmed(&mut self) -> Vec<Transaction> {
        std::mem::take(&mut self.unconfirmed)
    }

    /// Re-queue a stop whose resend failed again.
    pub fn requeue_unconfirmed(&mut self, transaction: Transaction) {
        self.unconfirmed.push(transaction);
    }
}
