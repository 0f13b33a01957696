use criterion::{criterion_group, criterion_main, Criterion};
use dbmaint_core::{
    analyze_script_updates, AnalyzerPolicy, ExecutedScript, ExecutionPlan, Script, ScriptContent,
    ScriptIndexes, ScriptKind, ScriptRepository,
};
use time::OffsetDateTime;

fn mk_indexed(index: u64) -> Script {
    Script {
        file_name: format!("{:02}_release/V{index}__step.sql", index / 100),
        indexes: Some(ScriptIndexes::new(vec![index / 100, index])),
        kind: ScriptKind::Incremental,
        patch: index % 17 == 0,
        checksum: format!("{index:064x}"),
        last_modified_at: i64::try_from(index).unwrap_or_default(),
        content: ScriptContent::Unavailable,
    }
}

fn mk_repeatable(index: u64) -> Script {
    Script {
        file_name: format!("R__view_{index}.sql"),
        indexes: None,
        kind: ScriptKind::Repeatable,
        patch: false,
        checksum: format!("r{index:063x}"),
        last_modified_at: 0,
        content: ScriptContent::Unavailable,
    }
}

fn mk_history(scripts: &[Script]) -> Vec<ExecutedScript> {
    scripts
        .iter()
        .cloned()
        .map(|script| ExecutedScript { script, executed_at: OffsetDateTime::UNIX_EPOCH, succeeded: true })
        .collect()
}

fn mk_repository(scripts: Vec<Script>) -> ScriptRepository {
    match ScriptRepository::new(scripts) {
        Ok(repository) => repository,
        Err(err) => panic!("benchmark repository is invalid: {err}"),
    }
}

fn bench_up_to_date(c: &mut Criterion) {
    let mut scripts = (1..=1_000).map(mk_indexed).collect::<Vec<_>>();
    scripts.extend((0..200).map(mk_repeatable));
    let history = mk_history(&scripts);
    let repository = mk_repository(scripts);
    let policy = AnalyzerPolicy { use_last_modification_dates: false, ..AnalyzerPolicy::default() };

    c.bench_function("analyze_up_to_date_1200_scripts", |b| {
        b.iter(|| {
            let analysis = analyze_script_updates(&repository, &history, policy);
            if !analysis.updates.is_empty() {
                panic!("up-to-date benchmark produced updates");
            }
        });
    });
}

fn bench_renames_and_additions(c: &mut Criterion) {
    let applied = (1..=800).map(mk_indexed).collect::<Vec<_>>();
    let history = mk_history(&applied);

    let mut scripts = applied
        .into_iter()
        .map(|script| {
            if script.indexes.as_ref().is_some_and(|indexes| indexes.as_slice()[1] % 10 == 0) {
                Script { file_name: format!("{}.renamed.sql", script.file_name), ..script }
            } else {
                script
            }
        })
        .collect::<Vec<_>>();
    scripts.extend((801..=1_000).map(mk_indexed));
    scripts.extend((0..200).map(mk_repeatable));
    let repository = mk_repository(scripts);
    let policy = AnalyzerPolicy::default();

    c.bench_function("analyze_and_plan_renames_and_additions", |b| {
        b.iter(|| {
            let analysis = analyze_script_updates(&repository, &history, policy);
            if analysis.updates.has_irregular_updates() {
                panic!("rename benchmark produced irregular updates");
            }
            let plan = ExecutionPlan::incremental(&analysis.updates, &repository);
            if plan.scripts.is_empty() {
                panic!("rename benchmark produced an empty plan");
            }
        });
    });
}

criterion_group!(analyzer_benches, bench_up_to_date, bench_renames_and_additions);
criterion_main!(analyzer_benches);
