// Polar 网盘驱动
//
// 分片上传协议：pre（预创建）→ hash（秒传检查）→ part（分片）
// → commit（提交分片 MD5 列表）→ finish（收尾）。

pub mod client;
pub mod driver;

pub use client::{PartBody, PolarApi, PolarClient, UploadPre};
pub use driver::{PolarDriver, POLAR_META_SHA1_KEY};
