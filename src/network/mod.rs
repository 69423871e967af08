pub mod ddos;
pub mod discovery;
pub mod noise;
pub mod pfs;
pub mod tls;
pub mod transport;
