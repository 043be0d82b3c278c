use metrics_exporter_prometheus::PrometheusBuilder;

#[test]
fn call_named_records_latency_and_errors() {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();

    let rt = tokio::runtime::Runtime::new().unwrap();
    metrics::with_local_recorder(&recorder, || {
        rt.block_on(async {
            let tmp = tempfile::NamedTempFile::new().unwrap();
            let db = common::db::AsyncDb::open(tmp.path().to_str().unwrap())
                .await
                .unwrap();

            let users: i64 = db
                .call_named("users.count", |conn| {
                    Ok(conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))?)
                })
                .await
                .unwrap();
            assert_eq!(users, 0);

            let err: anyhow::Result<()> = db
                .call_named("snapshots.bad", |conn| {
                    conn.execute("DELETE FROM no_such_table", [])?;
                    Ok(())
                })
                .await;
            assert!(err.is_err());
        });
    });

    let rendered = handle.render();
    assert!(
        rendered.contains("leaderboard_db_query_latency_ms"),
        "missing latency histogram:\n{rendered}"
    );
    assert!(
        rendered.contains("leaderboard_db_query_errors_total"),
        "missing error counter:\n{rendered}"
    );
    assert!(rendered.contains("snapshots.bad"), "op label missing:\n{rendered}");
}
