//! 后端基准测试
//!
//! 固定提示集逐条生成，记录延迟、吞吐与输出质量启发式，合成为 0–100 的分数：
//! score = 100 × (0.6 × 1/(1+平均延迟秒) + 0.4 × 平均质量)。

use std::time::Instant;

use futures_util::StreamExt;
use serde::Serialize;

use crate::llm::{Backend, ChatMessage, GenerateOptions, GenerationEvent};

pub const BENCHMARK_PROMPTS: [&str; 3] = [
    "What is 2+2?",
    "Explain recursion in one sentence.",
    "Name three primary colors.",
];

const LATENCY_WEIGHT: f64 = 0.6;
const QUALITY_WEIGHT: f64 = 0.4;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BenchmarkScore {
    pub backend: String,
    pub model: String,
    pub avg_latency_ms: f64,
    pub tokens_per_sec: f64,
    pub quality: f64,
    pub score: f64,
    pub errors: usize,
}

/// 单条回答的质量：非空 0.5，长度 8..=2000 字符 0.3，无错误 0.2
pub fn quality_heuristic(text: &str, had_error: bool) -> f64 {
    let trimmed = text.trim();
    let chars = trimmed.chars().count();
    let mut q = 0.0;
    if !trimmed.is_empty() {
        q += 0.5;
    }
    if (8..=2000).contains(&chars) {
        q += 0.3;
    }
    if !had_error {
        q += 0.2;
    }
    q
}

pub fn composite_score(avg_latency_secs: f64, quality: f64) -> f64 {
    100.0 * (LATENCY_WEIGHT / (1.0 + avg_latency_secs.max(0.0)) + QUALITY_WEIGHT * quality)
}

/// 排名：高分在前；sort_by 是稳定排序，平局保持传入（声明）顺序
pub fn rank(mut scores: Vec<BenchmarkScore>) -> Vec<BenchmarkScore> {
    scores.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    scores
}

/// 对任意后端运行基准测试（Backend::benchmark 的默认实现）
pub async fn run_benchmark<B: Backend + ?Sized>(backend: &B, model: &str) -> BenchmarkScore {
    let options = GenerateOptions {
        temperature: Some(0.0),
        max_tokens: Some(128),
    };
    let mut total_secs = 0.0;
    let mut total_quality = 0.0;
    let mut total_tokens = 0u64;
    let mut errors = 0usize;

    for prompt in BENCHMARK_PROMPTS {
        let started = Instant::now();
        let messages = [ChatMessage::user(prompt)];
        let mut stream = backend.generate(&messages, model, &options).await;
        let mut text = String::new();
        let mut had_error = false;
        let mut chunks = 0u64;
        let mut reported = None;
        while let Some(event) = stream.next().await {
            match event {
                GenerationEvent::TokenChunk(t) => {
                    chunks += 1;
                    text.push_str(&t);
                }
                GenerationEvent::ActionProposed(_) => chunks += 1,
                GenerationEvent::Error(e) => {
                    tracing::debug!(backend = %backend.name(), error = %e, "benchmark prompt failed");
                    had_error = true;
                    break;
                }
                GenerationEvent::Done(stats) => {
                    reported = stats.completion_tokens;
                    break;
                }
            }
        }
        if had_error {
            errors += 1;
        }
        total_secs += started.elapsed().as_secs_f64();
        total_tokens += reported.unwrap_or(chunks);
        total_quality += quality_heuristic(&text, had_error);
    }

    let n = BENCHMARK_PROMPTS.len() as f64;
    let avg_latency = total_secs / n;
    let quality = total_quality / n;
    let score = BenchmarkScore {
        backend: backend.name().to_string(),
        model: model.to_string(),
        avg_latency_ms: avg_latency * 1000.0,
        tokens_per_sec: if total_secs > 0.0 { total_tokens as f64 / total_secs } else { 0.0 },
        quality,
        score: composite_score(avg_latency, quality),
        errors,
    };
    tracing::info!(
        backend = %score.backend,
        model = %score.model,
        score = score.score,
        avg_latency_ms = score.avg_latency_ms,
        "benchmark finished"
    );
    score
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedBackend;

    #[test]
    fn test_quality_heuristic() {
        assert_eq!(quality_heuristic("", true), 0.0);
        assert!((quality_heuristic("4", false) - 0.7).abs() < 1e-9);
        assert!((quality_heuristic("Red, yellow and blue.", false) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_faster_scores_higher() {
        assert!(composite_score(0.1, 1.0) > composite_score(2.0, 1.0));
        assert!((composite_score(0.0, 1.0) - 100.0).abs() < 1e-9);
    }

    fn fixed(backend: &str, score: f64) -> BenchmarkScore {
        BenchmarkScore {
            backend: backend.into(),
            model: "m".into(),
            avg_latency_ms: 0.0,
            tokens_per_sec: 0.0,
            quality: 1.0,
            score,
            errors: 0,
        }
    }

    #[test]
    fn test_rank_ties_keep_declaration_order() {
        let ranking = rank(vec![
            fixed("first", 80.0),
            fixed("slow", 40.0),
            fixed("second", 80.0),
            fixed("best", 95.0),
            fixed("third", 80.0),
        ]);
        let names: Vec<_> = ranking.iter().map(|s| s.backend.as_str()).collect();
        assert_eq!(names, vec!["best", "first", "second", "third", "slow"]);
    }

    #[tokio::test]
    async fn test_unreachable_backend_scores_low() {
        let backend = ScriptedBackend::new("down", Vec::new()).unreachable();
        let score = backend.benchmark("any").await;
        assert_eq!(score.errors, 3);
        assert!(score.quality < 0.01);
    }
}
