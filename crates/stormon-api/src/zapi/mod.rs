//! Legacy XML-RPC transport.
//!
//! Requests are wrapped in a versioned `netapp` envelope and POSTed to the
//! appliance servlet. Iterator APIs page with an opaque `tag` cursor.

mod client;
mod system;


pub use client::ZapiClient;
pub use system::SystemInfo;

/// Cursor value for the first page of an iterator call.
pub const INITIAL_TAG: &str = "initial";

pub const ZAPI_NAMESPACE: &str = "http://www.netapp.com/filer/admin";

pub const ZAPI_VERSION: &str = "1.3";

pub const ZAPI_SERVLET: &str = "servlets/netapp.servlets.admin.XMLrequest_filer";
