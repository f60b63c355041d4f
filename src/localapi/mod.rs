// Client side of the local daemon's http API.
pub mod broker;
pub mod whois;
