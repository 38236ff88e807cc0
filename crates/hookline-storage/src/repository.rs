//! Repository layer for data access

pub mod campaigns;
pub mod delivery_units;
pub mod groups;

// Re-export concrete repository implementations with simple names
pub use campaigns::DbCampaignRepository as CampaignRepository;
pub use delivery_units::DbDeliveryUnitRepository as DeliveryUnitRepository;
pub use groups::DbGroupRepository as GroupRepository;

// Re-export repository traits
pub use campaigns::CampaignStore;
pub use delivery_units::DeliveryUnitStore;
pub use groups::GroupStore;
