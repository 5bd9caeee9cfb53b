//! 日志相关的共享定义

pub mod standards;
