use crate::model::Ms;

pub const MAX_USERNAME_LEN: usize = 80;
pub const MAX_RESOURCE_NAME_LEN: usize = 100;
pub const MAX_RESOURCE_TYPE_LEN: usize = 50;
pub const MAX_TITLE_LEN: usize = 100;
pub const MAX_DESCRIPTION_LEN: usize = 500;
pub const MAX_PROFILE_FIELD_LEN: usize = 200;

pub const MAX_USERS_PER_TENANT: usize = 100_000;
pub const MAX_RESOURCES_PER_TENANT: usize = 10_000;
pub const MAX_EVENTS_PER_TENANT: usize = 1_000_000;
pub const MAX_ALLOCATIONS_PER_RESOURCE: usize = 100_000;

/// 1970-01-01T00:00:00 on the naive clock.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 9999-12-31T23:59:59.999 on the naive clock.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;
