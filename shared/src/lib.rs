use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Customer,
    Farmer,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Customer => "CUSTOMER",
            Role::Farmer => "FARMER",
            Role::Admin => "ADMIN",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "CUSTOMER" => Some(Role::Customer),
            "FARMER" => Some(Role::Farmer),
            "ADMIN" => Some(Role::Admin),
            _ => None,
        }
    }

    pub fn is_staff(&self) -> bool {
        matches!(self, Role::Farmer | Role::Admin)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order lifecycle.
///
/// PENDING -> CONFIRMED happens only when a payment settles; staff drive
/// CONFIRMED -> SHIPPED -> DELIVERED. Any non-terminal order can still be
/// cancelled (customers only while PENDING, admins as an override).
/// DELIVERED and CANCELLED are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Shipped,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Confirmed => "CONFIRMED",
            OrderStatus::Shipped => "SHIPPED",
            OrderStatus::Delivered => "DELIVERED",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<OrderStatus> {
        match s {
            "PENDING" => Some(OrderStatus::Pending),
            "CONFIRMED" => Some(OrderStatus::Confirmed),
            "SHIPPED" => Some(OrderStatus::Shipped),
            "DELIVERED" => Some(OrderStatus::Delivered),
            "CANCELLED" => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Delivered | OrderStatus::Cancelled)
    }

    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed)
                | (Pending, Cancelled)
                | (Confirmed, Shipped)
                | (Confirmed, Cancelled)
                | (Shipped, Delivered)
                | (Shipped, Cancelled)
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether staff may move an order from `from` to `to`.
///
/// Farmers and admins advance fulfilment (CONFIRMED -> SHIPPED -> DELIVERED).
/// Cancellation of an arbitrary non-terminal order is an admin override.
/// PENDING -> CONFIRMED is never set by hand; the payment webhook owns it.
pub fn staff_transition_allowed(role: Role, from: OrderStatus, to: OrderStatus) -> bool {
    if !from.can_transition_to(to) {
        return false;
    }
    match to {
        OrderStatus::Cancelled => role == Role::Admin,
        OrderStatus::Shipped | OrderStatus::Delivered => role.is_staff(),
        _ => false,
    }
}

/// Payment attempt lifecycle.
///
/// Settled statuses absorb stale or replayed events: SUCCEEDED may only move
/// to REFUNDED, and FAILED/REFUNDED never move again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Succeeded => "SUCCEEDED",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::Refunded => "REFUNDED",
        }
    }

    pub fn parse(s: &str) -> Option<PaymentStatus> {
        match s {
            "PENDING" => Some(PaymentStatus::Pending),
            "SUCCEEDED" => Some(PaymentStatus::Succeeded),
            "FAILED" => Some(PaymentStatus::Failed),
            "REFUNDED" => Some(PaymentStatus::Refunded),
            _ => None,
        }
    }

    pub fn can_transition_to(self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, next),
            (Pending, Succeeded) | (Pending, Failed) | (Pending, Refunded) | (Succeeded, Refunded)
        )
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_status_round_trips_through_strings() {
        for status in [
            OrderStatus::Pending,
            OrderStatus::Confirmed,
            OrderStatus::Shipped,
            OrderStatus::Delivered,
            OrderStatus::Cancelled,
        ] {
            assert_eq!(OrderStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(OrderStatus::parse("REFUNDED"), None);
        assert_eq!(OrderStatus::parse("pending"), None);
    }

    #[test]
    fn order_transitions_follow_the_lifecycle() {
        use OrderStatus::*;
        assert!(Pending.can_transition_to(Confirmed));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Confirmed.can_transition_to(Shipped));
        assert!(Confirmed.can_transition_to(Cancelled));
        assert!(Shipped.can_transition_to(Delivered));
        assert!(Shipped.can_transition_to(Cancelled));

        assert!(!Pending.can_transition_to(Shipped));
        assert!(!Pending.can_transition_to(Delivered));
        assert!(!Confirmed.can_transition_to(Pending));
        assert!(!Confirmed.can_transition_to(Delivered));
        assert!(!Shipped.can_transition_to(Confirmed));
    }

    #[test]
    fn terminal_orders_never_move_again() {
        use OrderStatus::*;
        for terminal in [Delivered, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [Pending, Confirmed, Shipped, Delivered, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn staff_policy_by_role() {
        use OrderStatus::*;

        // Farmers advance fulfilment but cannot cancel.
        assert!(staff_transition_allowed(Role::Farmer, Confirmed, Shipped));
        assert!(staff_transition_allowed(Role::Farmer, Shipped, Delivered));
        assert!(!staff_transition_allowed(Role::Farmer, Confirmed, Cancelled));
        assert!(!staff_transition_allowed(Role::Farmer, Pending, Cancelled));

        // Admin override cancels any non-terminal order.
        assert!(staff_transition_allowed(Role::Admin, Pending, Cancelled));
        assert!(staff_transition_allowed(Role::Admin, Confirmed, Cancelled));
        assert!(staff_transition_allowed(Role::Admin, Shipped, Cancelled));
        assert!(!staff_transition_allowed(Role::Admin, Cancelled, Cancelled));
        assert!(!staff_transition_allowed(Role::Admin, Delivered, Cancelled));

        // Confirmation is reserved for the payment webhook.
        assert!(!staff_transition_allowed(Role::Admin, Pending, Confirmed));
        assert!(!staff_transition_allowed(Role::Farmer, Pending, Confirmed));

        // Customers never appear here at all.
        assert!(!staff_transition_allowed(Role::Customer, Confirmed, Shipped));
    }

    #[test]
    fn payment_transitions_protect_settled_money() {
        use PaymentStatus::*;
        assert!(Pending.can_transition_to(Succeeded));
        assert!(Pending.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Refunded));
        assert!(Succeeded.can_transition_to(Refunded));

        // A stale "succeeded" replay must not resurrect settled attempts.
        assert!(!Succeeded.can_transition_to(Succeeded));
        assert!(!Refunded.can_transition_to(Succeeded));
        assert!(!Refunded.can_transition_to(Refunded));
        assert!(!Failed.can_transition_to(Succeeded));
        assert!(!Failed.can_transition_to(Refunded));
    }

    #[test]
    fn role_parsing_matches_wire_spellings() {
        assert_eq!(Role::parse("CUSTOMER"), Some(Role::Customer));
        assert_eq!(Role::parse("FARMER"), Some(Role::Farmer));
        assert_eq!(Role::parse("ADMIN"), Some(Role::Admin));
        assert_eq!(Role::parse("customer"), None);
        assert!(Role::Farmer.is_staff());
        assert!(Role::Admin.is_staff());
        assert!(!Role::Customer.is_staff());
    }
}
