//! Order placement with retry-until-terminal status polling.

use crate::broker::{BrokerClient, OrderRequest, OrderStatus};
use crate::clock::Clock;
use crate::config::SessionConfig;
use crate::error::BrokerError;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Order id recorded for simulated fills.
pub const PAPER_ORDER_ID: &str = "PAPER_TRADE";

/// Places market orders and waits for them to settle.
///
/// A placement counts as failed when the broker rejects it, when the order
/// ends CANCELLED or REJECTED, or when no terminal status shows up within
/// `max_status_polls`. Failed placements are retried; running out of
/// attempts is fatal.
#[derive(Clone)]
pub struct OrderGateway {
    client: Arc<dyn BrokerClient>,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
    max_status_polls: u32,
    delay: Duration,
}

impl OrderGateway {
    pub fn new(client: Arc<dyn BrokerClient>, clock: Arc<dyn Clock>, settings: &SessionConfig) -> Self {
        Self {
            client,
            clock,
            max_attempts: settings.max_order_placement_retries,
            max_status_polls: settings.max_status_polls,
            delay: settings.retry_delay(),
        }
    }

    /// Execute `order` and return the broker order id. Paper orders never
    /// reach the broker and return [`PAPER_ORDER_ID`].
    pub async fn execute(&self, order: &OrderRequest, paper: bool) -> Result<String, BrokerError> {
        if paper {
            info!(
                target: "orders",
                symbol = %order.tradingsymbol,
                side = %order.transaction_type,
                quantity = order.quantity,
                "Paper order filled"
            );
            return Ok(PAPER_ORDER_ID.to_string());
        }

        let mut last_error = String::new();

        for attempt in 1..=self.max_attempts {
            match self.client.place_order(order).await {
                Ok(order_id) => match self.await_terminal(&order_id).await {
                    Some(OrderStatus::Complete) => {
                        info!(
                            target: "orders",
                            %order_id,
                            symbol = %order.tradingsymbol,
                            side = %order.transaction_type,
                            quantity = order.quantity,
                            attempt,
                            "Order complete"
                        );
                        return Ok(order_id);
                    }
                    Some(status) => {
                        warn!(target: "orders", %order_id, %status, attempt, "Order not filled, retrying");
                        last_error = format!("order {} ended {}", order_id, status);
                    }
                    None => {
                        warn!(target: "orders", %order_id, attempt, "Order status never settled, retrying");
                        last_error = format!("order {} did not reach a terminal status", order_id);
                    }
                },
                Err(e) => {
                    warn!(target: "orders", error = %e, attempt, "Order placement failed, retrying");
                    last_error = e.to_string();
                }
            }

            self.clock.sleep(self.delay).await;
        }

        error!(
            target: "orders",
            symbol = %order.tradingsymbol,
            side = %order.transaction_type,
            "Order placement max retries exceeded"
        );
        Err(BrokerError::RetriesExhausted {
            operation: "order placement",
            attempts: self.max_attempts,
            last_error,
        })
    }

    /// Poll the order history until its latest status is terminal.
    async fn await_terminal(&self, order_id: &str) -> Option<OrderStatus> {
        for _ in 0..self.max_status_polls {
            match self.client.order_history(order_id).await {
                Ok(history) => {
                    if let Some(latest) = history.last() {
                        if latest.status.is_terminal() {
                            return Some(latest.status.clone());
                        }
                    }
                }
                Err(e) => warn!(target: "orders", %order_id, error = %e, "Order status read failed"),
            }
            self.clock.sleep(self.delay).await;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MockBrokerClient, OrderEvent, TransactionType};
    use crate::clock::ManualClock;

    fn event(status: &str) -> OrderEvent {
        OrderEvent {
            order_id: "1001".into(),
            status: OrderStatus::from(status.to_string()),
            status_message: None,
            average_price: None,
            filled_quantity: None,
        }
    }

    fn order() -> OrderRequest {
        OrderRequest {
            exchange: "NFO".into(),
            tradingsymbol: "BANKNIFTY24MAR47000PE".into(),
            transaction_type: TransactionType::Buy,
            quantity: 25,
        }
    }

    fn gateway(mock: MockBrokerClient) -> OrderGateway {
        OrderGateway::new(
            Arc::new(mock),
            Arc::new(ManualClock::parse("2024-03-04 10:00:00")),
            &SessionConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_paper_order_skips_broker() {
        let mut mock = MockBrokerClient::new();
        mock.expect_place_order().never();

        let id = gateway(mock).execute(&order(), true).await.unwrap();
        assert_eq!(id, PAPER_ORDER_ID);
    }

    #[tokio::test]
    async fn test_polls_until_complete() {
        let mut mock = MockBrokerClient::new();
        mock.expect_place_order()
            .times(1)
            .returning(|_| Ok("1001".to_string()));

        let mut polls = 0;
        mock.expect_order_history().times(3).returning(move |_| {
            polls += 1;
            Ok(match polls {
                1 => vec![event("PUT ORDER REQ RECEIVED")],
                2 => vec![event("PUT ORDER REQ RECEIVED"), event("OPEN")],
                _ => vec![event("OPEN"), event("COMPLETE")],
            })
        });

        let id = gateway(mock).execute(&order(), false).await.unwrap();
        assert_eq!(id, "1001");
    }

    #[tokio::test]
    async fn test_rejection_then_success_retries_placement() {
        let mut mock = MockBrokerClient::new();
        let mut placed = 0;
        mock.expect_place_order().times(2).returning(move |_| {
            placed += 1;
            Ok(format!("{}", 1000 + placed))
        });
        mock.expect_order_history().returning(|id| {
            Ok(vec![event(if id == "1001" { "REJECTED" } else { "COMPLETE" })])
        });

        let id = gateway(mock).execute(&order(), false).await.unwrap();
        assert_eq!(id, "1002");
    }

    #[tokio::test]
    async fn test_exhaustion_is_fatal() {
        let mut mock = MockBrokerClient::new();
        mock.expect_place_order()
            .times(5)
            .returning(|_| Err(BrokerError::OrderPlacement("InputException: bad symbol".into())));

        let err = gateway(mock).execute(&order(), false).await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(
            err,
            BrokerError::RetriesExhausted {
                operation: "order placement",
                attempts: 5,
                last_error: "order placement failed: InputException: bad symbol".into(),
            }
        );
    }
}
