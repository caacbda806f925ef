//! SyncBridge Provisioning Workflows
//!
//! The inter-application business operations of the platform, expressed as
//! durable workflows: creating an organization in the downstream
//! application, allocating its initial credits, and syncing its users. Each
//! activity performs its idempotency-keyed external effect and then
//! publishes the corresponding sync event.

pub mod activities;
pub mod gateway;
pub mod ledger;
pub mod workflow;

pub use activities::{
    AllocateCreditsActivity, CreateOrganizationActivity, SyncUsersActivity,
};
pub use gateway::{
    DirectoryGateway, GatewayError, HttpDirectoryGateway, HttpDirectoryGatewayConfig,
    OrganizationRecord, OrganizationSpec, UserSpec,
};
pub use ledger::{CreditAllocation, CreditLedger, InMemoryCreditLedger};
pub use workflow::OrganizationProvisioningWorkflow;
