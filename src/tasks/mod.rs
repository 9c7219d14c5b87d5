// 具体任务类型
//
// 七种任务类型共用四个载荷结构：复制与移动共用 FileTransferTask，
// 其余各自一个。执行器只依赖抽象驱动面。

pub mod decompress;
pub mod env;
pub mod file_transfer;
pub mod offline_download;
pub mod upload;

pub use decompress::{ArchiveContentUploadTask, ArchiveDownloadTask};
pub use env::TaskEnv;
pub use file_transfer::{FileTransferTask, TransferMode};
pub use offline_download::{DownloadTask, TransferTask};
pub use upload::UploadTask;
