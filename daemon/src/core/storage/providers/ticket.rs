use async_trait::async_trait;

use meridian_common::approval::{ApprovalTicket, TicketId};

use crate::core::{error::StorageError, storage::SledStorage};

#[async_trait]
pub trait TicketProvider {
    async fn next_ticket_id(&self) -> Result<TicketId, StorageError>;

    async fn get_ticket(&self, id: TicketId) -> Result<Option<ApprovalTicket>, StorageError>;

    async fn expect_ticket(&self, id: TicketId) -> Result<ApprovalTicket, StorageError>;

    async fn set_ticket(&self, ticket: &ApprovalTicket) -> Result<(), StorageError>;

    async fn list_open_tickets(&self) -> Result<Vec<ApprovalTicket>, StorageError>;
}

#[async_trait]
impl TicketProvider for SledStorage {
    async fn next_ticket_id(&self) -> Result<TicketId, StorageError> {
        self.next_id("ticket_id")
    }

    async fn get_ticket(&self, id: TicketId) -> Result<Option<ApprovalTicket>, StorageError> {
        Self::get_decoded(&self.tickets, &id.to_be_bytes())
    }

    async fn expect_ticket(&self, id: TicketId) -> Result<ApprovalTicket, StorageError> {
        self.get_ticket(id)
            .await?
            .ok_or_else(|| StorageError::not_found("ticket", id))
    }

    async fn set_ticket(&self, ticket: &ApprovalTicket) -> Result<(), StorageError> {
        Self::put_encoded(&self.tickets, &ticket.id.to_be_bytes(), ticket)
    }

    async fn list_open_tickets(&self) -> Result<Vec<ApprovalTicket>, StorageError> {
        let mut tickets = Vec::new();
        for entry in self.tickets.iter() {
            let (_, value) = entry?;
            let ticket: ApprovalTicket = Self::decode(&value)?;
            if !ticket.status.is_terminal() {
                tickets.push(ticket);
            }
        }
        Ok(tickets)
    }
}
