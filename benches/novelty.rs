//! Novelty-scoring benchmark: the analyzer runs once per iteration
//! against the recent-artifact window, so nearest-neighbor scoring
//! must stay cheap.

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};

use alphaloop::domain::models::config::NoveltyConfig;
use alphaloop::services::novelty::NoveltyAnalyzer;
use alphaloop::testutil::{code_artifact, seed_artifact};

fn bench_novelty(c: &mut Criterion) {
    let analyzer = NoveltyAnalyzer::new(NoveltyConfig::default());
    let priors: Vec<_> = (0..20)
        .map(|i| {
            if i % 2 == 0 {
                seed_artifact()
            } else {
                code_artifact(&format!(
                    "strategy s{i} {{\n\
                     let m = momentum(close_adj, lookback = {});\n\
                     let t = select_top(m, count = {});\n\
                     positions = weight_equal(t);\n\
                     }}",
                    10 + i,
                    5 + i % 10,
                ))
            }
        })
        .collect();
    let candidate = code_artifact(
        "strategy c {\n\
         let r = mean_reversion(close_adj, window = 20);\n\
         let l = liquidity_filter(turnover, min_turnover = 50000000);\n\
         positions = weight_by_score(mask(r, l));\n\
         }",
    );

    c.bench_function("novelty_score_vs_20_priors", |b| {
        b.iter_batched(
            || candidate.clone(),
            |candidate| analyzer.score(&candidate, &priors),
            BatchSize::SmallInput,
        );
    });

    c.bench_function("population_diversity_20", |b| {
        b.iter(|| analyzer.population_diversity(&priors));
    });
}

criterion_group!(benches, bench_novelty);
criterion_main!(benches);
