mod qwen3;

pub use qwen3::Qwen3Model;
