pub mod debounce;
pub mod machine;
pub mod napi;
pub mod sysinfo;
pub mod vmadm;
pub mod zones;
