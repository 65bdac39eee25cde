pub mod nacos;

pub use nacos::NacosDiscovery;
