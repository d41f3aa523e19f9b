use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use reqwest::Client;
use serde::Serialize;
use tracing::{error, warn};
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::{Order, OrderItem, Product, User};
use crate::schema::{order_items, products, users};

pub const RETRY_ATTEMPTS: u32 = 3;
pub const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub html: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> anyhow::Result<()>;
}

/// HTTP mail transport (Resend-style JSON API).
pub struct ResendMailer {
    http: Client,
    api_key: String,
    from: String,
}

impl ResendMailer {
    pub fn new(api_key: String, from: String) -> Self {
        Self {
            http: Client::new(),
            api_key,
            from,
        }
    }
}

#[derive(Serialize)]
struct ResendRequest<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    html: &'a str,
}

#[async_trait]
impl Mailer for ResendMailer {
    async fn send(&self, message: &EmailMessage) -> anyhow::Result<()> {
        let response = self
            .http
            .post("https://api.resend.com/emails")
            .bearer_auth(&self.api_key)
            .json(&ResendRequest {
                from: &self.from,
                to: &message.to,
                subject: &message.subject,
                html: &message.html,
            })
            .send()
            .await?;
        if !response.status().is_success() {
            anyhow::bail!("mail transport returned {}", response.status());
        }
        Ok(())
    }
}

/// Best-effort delivery fan-out. Each message gets its own task and its own
/// bounded retry; nothing here can fail the operation that triggered it.
pub struct NotificationDispatcher {
    mailer: Arc<dyn Mailer>,
    attempts: u32,
    base_delay: Duration,
}

impl NotificationDispatcher {
    pub fn new(mailer: Arc<dyn Mailer>) -> Self {
        Self {
            mailer,
            attempts: RETRY_ATTEMPTS,
            base_delay: RETRY_BASE_DELAY,
        }
    }

    pub fn dispatch(&self, messages: Vec<EmailMessage>) {
        for message in messages {
            let mailer = Arc::clone(&self.mailer);
            let attempts = self.attempts;
            let base_delay = self.base_delay;
            tokio::spawn(async move {
                deliver(mailer, message, attempts, base_delay).await;
            });
        }
    }
}

/// Up to `attempts` tries with linear backoff (`base_delay * attempt`).
/// The final failure is logged and swallowed.
async fn deliver(mailer: Arc<dyn Mailer>, message: EmailMessage, attempts: u32, base_delay: Duration) {
    for attempt in 1..=attempts {
        match mailer.send(&message).await {
            Ok(()) => return,
            Err(e) if attempt == attempts => {
                error!(
                    to = %message.to,
                    subject = %message.subject,
                    error = %e,
                    "notification dropped after {} attempts",
                    attempts
                );
            }
            Err(e) => {
                warn!(to = %message.to, attempt, error = %e, "notification attempt failed, retrying");
                tokio::time::sleep(base_delay * attempt).await;
            }
        }
    }
}

/// One line of goods inside an order, denormalized for rendering.
#[derive(Debug, Clone)]
pub struct GoodsLine {
    pub farmer_id: Uuid,
    pub name: String,
    pub quantity: i32,
    pub price: BigDecimal,
}

struct OrderParties {
    customer: Option<User>,
    farmers: HashMap<Uuid, User>,
    lines: Vec<GoodsLine>,
}

async fn load_parties(conn: &mut AsyncPgConnection, order: &Order) -> Result<OrderParties, ApiError> {
    let rows: Vec<(OrderItem, Product)> = order_items::table
        .inner_join(products::table)
        .filter(order_items::order_id.eq(order.id))
        .load(conn)
        .await?;

    let lines: Vec<GoodsLine> = rows
        .into_iter()
        .map(|(item, product)| GoodsLine {
            farmer_id: product.farmer_id,
            name: product.name,
            quantity: item.quantity,
            price: item.price,
        })
        .collect();

    let customer = users::table
        .find(order.user_id)
        .first::<User>(conn)
        .await
        .optional()?;

    let farmer_ids: Vec<Uuid> = {
        let mut ids: Vec<Uuid> = lines.iter().map(|l| l.farmer_id).collect();
        ids.sort();
        ids.dedup();
        ids
    };
    let farmers: HashMap<Uuid, User> = users::table
        .filter(users::id.eq_any(&farmer_ids))
        .load::<User>(conn)
        .await?
        .into_iter()
        .map(|u| (u.id, u))
        .collect();

    Ok(OrderParties {
        customer,
        farmers,
        lines,
    })
}

fn group_by_farmer(lines: &[GoodsLine]) -> HashMap<Uuid, Vec<&GoodsLine>> {
    let mut groups: HashMap<Uuid, Vec<&GoodsLine>> = HashMap::new();
    for line in lines {
        groups.entry(line.farmer_id).or_default().push(line);
    }
    groups
}

fn goods_list_html(lines: &[&GoodsLine]) -> String {
    let items: String = lines
        .iter()
        .map(|l| format!("<li>{} x {} @ {}</li>", l.quantity, l.name, l.price))
        .collect();
    format!("<ul>{}</ul>", items)
}

fn goods_total(lines: &[&GoodsLine]) -> BigDecimal {
    lines.iter().fold(BigDecimal::from(0), |acc, l| {
        acc + &l.price * BigDecimal::from(l.quantity)
    })
}

/// New-order emails: one per distinct farmer with goods in the order, plus
/// the customer confirmation.
pub async fn order_placed_messages(
    conn: &mut AsyncPgConnection,
    order: &Order,
) -> Result<Vec<EmailMessage>, ApiError> {
    let parties = load_parties(conn, order).await?;
    let mut messages = Vec::new();

    for (farmer_id, lines) in group_by_farmer(&parties.lines) {
        let Some(farmer) = parties.farmers.get(&farmer_id) else {
            continue;
        };
        messages.push(EmailMessage {
            to: farmer.email.clone(),
            subject: "New Order Received".to_string(),
            html: format!(
                "<h2>New Order Placed</h2><p>Order #{}</p>{}<p>Total: {}</p>",
                order.id,
                goods_list_html(&lines),
                goods_total(&lines)
            ),
        });
    }

    if let Some(customer) = &parties.customer {
        let all: Vec<&GoodsLine> = parties.lines.iter().collect();
        messages.push(EmailMessage {
            to: customer.email.clone(),
            subject: "Order Confirmation".to_string(),
            html: format!(
                "<h2>Thank you for your order!</h2><p>Order #{}</p>{}<p>Total: {}</p><p>Status: {}</p>",
                order.id,
                goods_list_html(&all),
                order.total_amount,
                order.status
            ),
        });
    }

    Ok(messages)
}

/// Payment-settled emails for the customer and every farmer involved.
pub async fn order_paid_messages(
    conn: &mut AsyncPgConnection,
    order: &Order,
) -> Result<Vec<EmailMessage>, ApiError> {
    let parties = load_parties(conn, order).await?;
    let mut messages = Vec::new();

    for (farmer_id, lines) in group_by_farmer(&parties.lines) {
        let Some(farmer) = parties.farmers.get(&farmer_id) else {
            continue;
        };
        messages.push(EmailMessage {
            to: farmer.email.clone(),
            subject: format!("Order #{} Paid", order.id),
            html: format!(
                "<p>Order #{} has been paid and confirmed.</p>{}",
                order.id,
                goods_list_html(&lines)
            ),
        });
    }

    if let Some(customer) = &parties.customer {
        messages.push(EmailMessage {
            to: customer.email.clone(),
            subject: format!("Payment Received for Order #{}", order.id),
            html: format!(
                "<p>We received your payment of {} for order #{}. Your order is confirmed.</p>",
                order.total_amount, order.id
            ),
        });
    }

    Ok(messages)
}

/// Status-change emails for every farmer involved plus the customer.
pub async fn status_changed_messages(
    conn: &mut AsyncPgConnection,
    order: &Order,
) -> Result<Vec<EmailMessage>, ApiError> {
    let parties = load_parties(conn, order).await?;
    let mut messages = Vec::new();

    for farmer in parties.farmers.values() {
        messages.push(EmailMessage {
            to: farmer.email.clone(),
            subject: format!("Order #{} Status Updated", order.id),
            html: format!(
                "<p>Order #{} status changed to <b>{}</b>.</p>",
                order.id, order.status
            ),
        });
    }

    if let Some(customer) = &parties.customer {
        messages.push(EmailMessage {
            to: customer.email.clone(),
            subject: format!("Your Order #{} Status Updated", order.id),
            html: format!(
                "<p>Your order status has been updated to <b>{}</b>.</p>",
                order.status
            ),
        });
    }

    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    struct FlakyMailer {
        calls: AtomicU32,
        fail_first: u32,
        sent_to: Mutex<Vec<String>>,
    }

    impl FlakyMailer {
        fn new(fail_first: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_first,
                sent_to: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> u32 {
            AtomicU32::load(&self.calls, Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Mailer for FlakyMailer {
        async fn send(&self, message: &EmailMessage) -> anyhow::Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_first {
                anyhow::bail!("smtp unavailable");
            }
            self.sent_to
                .lock()
                .expect("lock")
                .push(message.to.clone());
            Ok(())
        }
    }

    fn message(to: &str) -> EmailMessage {
        EmailMessage {
            to: to.to_string(),
            subject: "subject".to_string(),
            html: "<p>body</p>".to_string(),
        }
    }

    #[tokio::test]
    async fn first_attempt_success_sends_once() {
        let mailer = Arc::new(FlakyMailer::new(0));
        deliver(mailer.clone(), message("a@example.com"), 3, Duration::from_secs(1)).await;
        assert_eq!(mailer.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_linear_backoff_then_succeeds() {
        let mailer = Arc::new(FlakyMailer::new(2));
        let started = Instant::now();
        deliver(mailer.clone(), message("a@example.com"), 3, Duration::from_secs(1)).await;
        // failed at t=0 (sleep 1s), failed again (sleep 2s), then delivered
        assert_eq!(mailer.calls(), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(3));
        assert_eq!(*mailer.sent_to.lock().expect("lock"), vec!["a@example.com"]);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_is_swallowed_after_three_attempts() {
        let mailer = Arc::new(FlakyMailer::new(u32::MAX));
        deliver(mailer.clone(), message("a@example.com"), 3, Duration::from_secs(1)).await;
        assert_eq!(mailer.calls(), 3);
        assert!(mailer.sent_to.lock().expect("lock").is_empty());
    }

    struct RecipientMailer {
        sent_to: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Mailer for RecipientMailer {
        async fn send(&self, message: &EmailMessage) -> anyhow::Result<()> {
            if message.to == "broken@example.com" {
                anyhow::bail!("mailbox on fire");
            }
            self.sent_to
                .lock()
                .expect("lock")
                .push(message.to.clone());
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn one_failing_recipient_does_not_block_others() {
        let mailer = Arc::new(RecipientMailer {
            sent_to: Mutex::new(Vec::new()),
        });
        let dispatcher = NotificationDispatcher::new(mailer.clone());
        dispatcher.dispatch(vec![
            message("broken@example.com"),
            message("healthy@example.com"),
        ]);

        // long enough for the failing recipient to exhaust its retries
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(
            *mailer.sent_to.lock().expect("lock"),
            vec!["healthy@example.com"]
        );
    }

    #[test]
    fn farmers_are_grouped_and_totalled_independently() {
        let farmer_a = Uuid::new_v4();
        let farmer_b = Uuid::new_v4();
        let lines = vec![
            GoodsLine {
                farmer_id: farmer_a,
                name: "Tomatoes".to_string(),
                quantity: 2,
                price: BigDecimal::from(50),
            },
            GoodsLine {
                farmer_id: farmer_b,
                name: "Honey".to_string(),
                quantity: 1,
                price: BigDecimal::from(100),
            },
            GoodsLine {
                farmer_id: farmer_a,
                name: "Eggs".to_string(),
                quantity: 3,
                price: BigDecimal::from(10),
            },
        ];

        let groups = group_by_farmer(&lines);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[&farmer_a].len(), 2);
        assert_eq!(groups[&farmer_b].len(), 1);
        assert_eq!(goods_total(&groups[&farmer_a]), BigDecimal::from(130));
        assert_eq!(goods_total(&groups[&farmer_b]), BigDecimal::from(100));

        let html = goods_list_html(&groups[&farmer_b]);
        assert!(html.contains("1 x Honey @ 100"));
    }
}
