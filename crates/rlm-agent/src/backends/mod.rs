/// OpenAI-compatible chat completions (OpenAI, OpenRouter, any compatible gateway).
pub mod openai;
