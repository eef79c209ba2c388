// 打印机摄像头代理
//
// 把打印机私有的摄像头控制与推流协议代理为标准的Web媒体格式。

pub mod codec;
pub mod config;
pub mod control;
pub mod credentials;
pub mod encoder;
pub mod ingest;
pub mod mux;
pub mod serde_helpers;
pub mod server;
pub mod session;
pub mod task;
