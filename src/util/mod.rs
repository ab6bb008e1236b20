pub mod hostname_radix_tree;
pub mod ip_set;
pub mod ttl_cache;
