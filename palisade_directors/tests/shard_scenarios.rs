//! Shard director: staged reconfiguration, pick stability, rampup and
//! warmup behavior.

use palisade::params::Params;
use palisade::vtim;
use palisade_core::{AdminHealth, Backend, BackendDef, Runtime};
use palisade_directors::shard::ShardDirector;
use palisade_directors::{DirectorError, HashBy, HealthyPolicy, ShardParam};
use palisade_shm::{VslCursor, VslTag, VsmReader};
use std::sync::Arc;

fn mk_runtime() -> (tempfile::TempDir, Arc<Runtime>) {
    let dir = tempfile::tempdir().unwrap();
    let mut params = Params::default();
    params.expiry_sleep = 0.5;
    let rt = Runtime::new(params, dir.path()).unwrap();
    (dir, rt)
}

fn mk_backend(rt: &Runtime, name: &str, port: u16) -> Arc<Backend> {
    rt.new_backend(BackendDef {
        name: name.to_string(),
        v4: Some(format!("127.0.0.1:{port}").parse().unwrap()),
        v6: None,
        proto: "http".to_string(),
        probe: None,
    })
}

fn by_url() -> ShardParam {
    ShardParam {
        by: Some(HashBy::Url),
        ..Default::default()
    }
}

/// Build a shard over the named backends in one task.
fn populate(rt: &Runtime, shard: &ShardDirector, names: &[(&str, u16)], replicas: i64) {
    let mut ctx = rt.ctx();
    for (name, port) in names {
        let be = rt
            .backends
            .by_name(name)
            .unwrap_or_else(|| mk_backend(rt, name, *port));
        shard.add_backend(&mut ctx, be, None, None, 1).unwrap();
    }
    shard.reconfigure(&mut ctx, replicas).unwrap();
    ctx.end();
}

#[test]
fn test_pick_is_idempotent_and_stable_under_removal() {
    let (_d, rt) = mk_runtime();
    let shard = ShardDirector::new("s0", rt.lock_class("shard"), 0.0);
    populate(&rt, &shard, &[("a", 7000), ("b", 7001), ("c", 7002)], 1000);

    let mut ctx = rt.ctx();
    ctx.url = "example.com".to_string();
    let args = by_url();

    let x = shard.backend(&mut ctx, &args).unwrap().unwrap();
    for _ in 0..20 {
        let again = shard.backend(&mut ctx, &args).unwrap().unwrap();
        assert!(Arc::ptr_eq(&x, &again), "pick must be idempotent");
    }
    ctx.end();

    // Remove a backend that is NOT the picked one; the pick must hold.
    let victim = ["a", "b", "c"]
        .iter()
        .find(|n| **n != x.name)
        .unwrap()
        .to_string();
    let mut ctx = rt.ctx();
    let vb = rt.backends.by_name(&victim).unwrap();
    shard.remove_backend(&mut ctx, Some(vb), None).unwrap();
    shard.reconfigure(&mut ctx, 1000).unwrap();
    ctx.end();

    let mut ctx = rt.ctx();
    ctx.url = "example.com".to_string();
    let y = shard.backend(&mut ctx, &args).unwrap().unwrap();
    assert_eq!(y.name, x.name, "removing another backend must not remap");
    ctx.end();
    rt.shutdown();
}

#[test]
fn test_staged_reconfigure_with_duplicate_and_remove() {
    let (dir, rt) = mk_runtime();
    let shard = ShardDirector::new("s1", rt.lock_class("shard"), 0.0);
    let a = mk_backend(&rt, "a", 7100);
    let b = mk_backend(&rt, "b", 7101);

    let mut ctx = rt.ctx();
    shard
        .add_backend(&mut ctx, Arc::clone(&a), None, None, 1)
        .unwrap();
    shard
        .add_backend(&mut ctx, Arc::clone(&b), None, None, 1)
        .unwrap();
    // Duplicate: skipped with a notice at reconfigure time.
    shard
        .add_backend(&mut ctx, Arc::clone(&a), None, None, 1)
        .unwrap();
    shard.remove_backend(&mut ctx, Some(b), None).unwrap();
    shard.reconfigure(&mut ctx, 67).unwrap();
    ctx.end();

    assert_eq!(shard.n_backend(), 1);
    assert_eq!(shard.backends()[0].backend.name, "a");
    assert_eq!(shard.n_points(), 67);

    // The duplicate add left a notice in the transaction log.
    let reader = VsmReader::attach(dir.path()).unwrap();
    let (recs, _) = VslCursor::attach(&reader).unwrap().read_all();
    assert!(
        recs.iter().any(|r| {
            r.vsl_tag() == Some(VslTag::Notice)
                && r.text().contains("already exists - skipping")
        }),
        "duplicate add must emit a notice"
    );
    rt.shutdown();
}

#[test]
fn test_clear_restarts_the_change_list() {
    let (_d, rt) = mk_runtime();
    let shard = ShardDirector::new("s2", rt.lock_class("shard"), 0.0);
    let a = mk_backend(&rt, "a", 7200);
    let b = mk_backend(&rt, "b", 7201);
    populate(&rt, &shard, &[("a", 7200)], 10);

    let mut ctx = rt.ctx();
    shard
        .add_backend(&mut ctx, Arc::clone(&a), Some("x"), None, 1)
        .unwrap();
    shard.clear(&mut ctx).unwrap();
    shard
        .add_backend(&mut ctx, Arc::clone(&b), None, None, 1)
        .unwrap();
    shard.reconfigure(&mut ctx, 10).unwrap();
    ctx.end();

    // Everything before the clear is gone, including the live set.
    assert_eq!(shard.n_backend(), 1);
    assert_eq!(shard.backends()[0].backend.name, "b");
    rt.shutdown();
}

#[test]
fn test_staged_changes_invisible_until_reconfigure() {
    let (_d, rt) = mk_runtime();
    let shard = ShardDirector::new("s3", rt.lock_class("shard"), 0.0);
    populate(&rt, &shard, &[("a", 7300)], 10);

    let mut ctx = rt.ctx();
    let b = mk_backend(&rt, "b", 7301);
    shard.add_backend(&mut ctx, b, None, None, 1).unwrap();
    assert_eq!(shard.n_backend(), 1, "staged add must not touch the ring");
    // The task dies without reconfigure: the change list dies with it.
    ctx.end();
    drop(ctx);

    let mut ctx = rt.ctx();
    shard.reconfigure(&mut ctx, 10).unwrap();
    assert_eq!(shard.n_backend(), 1, "abandoned change list left no trace");
    ctx.end();
    rt.shutdown();
}

#[test]
fn test_one_director_per_task() {
    let (_d, rt) = mk_runtime();
    let s1 = ShardDirector::new("first", rt.lock_class("shard"), 0.0);
    let s2 = ShardDirector::new("second", rt.lock_class("shard"), 0.0);
    let a = mk_backend(&rt, "a", 7400);

    let mut ctx = rt.ctx();
    s1.add_backend(&mut ctx, Arc::clone(&a), None, None, 1).unwrap();
    let err = s2.add_backend(&mut ctx, a, None, None, 1);
    assert!(matches!(err, Err(DirectorError::ChangeConflict { .. })));
    ctx.end();
    rt.shutdown();
}

#[test]
fn test_degenerate_health_cases() {
    let (_d, rt) = mk_runtime();
    let shard = ShardDirector::new("s4", rt.lock_class("shard"), 0.0);
    populate(&rt, &shard, &[("a", 7500), ("b", 7501)], 100);

    let a = rt.backends.by_name("a").unwrap();
    let b = rt.backends.by_name("b").unwrap();

    // One healthy backend: every key lands on it.
    a.set_admin_health(AdminHealth::Sick, vtim::real_now());
    let mut ctx = rt.ctx();
    for i in 0..50 {
        ctx.url = format!("key-{i}");
        let picked = shard.backend(&mut ctx, &by_url()).unwrap();
        assert_eq!(picked.unwrap().name, "b");
    }

    // Zero healthy: None...
    b.set_admin_health(AdminHealth::Sick, vtim::real_now());
    ctx.url = "anything".to_string();
    assert!(shard.backend(&mut ctx, &by_url()).unwrap().is_none());

    // ...unless health is ignored.
    let ignore = ShardParam {
        by: Some(HashBy::Url),
        healthy: Some(HealthyPolicy::Ignore),
        ..Default::default()
    };
    assert!(shard.backend(&mut ctx, &ignore).unwrap().is_some());
    ctx.end();
    rt.shutdown();
}

#[test]
fn test_minimal_disruption_on_add() {
    let (_d, rt) = mk_runtime();
    let shard = ShardDirector::new("s5", rt.lock_class("shard"), 0.0);
    populate(
        &rt,
        &shard,
        &[("a", 7600), ("b", 7601), ("c", 7602)],
        200,
    );

    let keys: Vec<String> = (0..600).map(|i| format!("object-{i}")).collect();
    let mut ctx = rt.ctx();
    let before: Vec<String> = keys
        .iter()
        .map(|k| {
            ctx.url = k.clone();
            shard.backend(&mut ctx, &by_url()).unwrap().unwrap().name.clone()
        })
        .collect();
    ctx.end();

    // Add a fourth equal-weight backend.
    let mut ctx = rt.ctx();
    let d = mk_backend(&rt, "d", 7603);
    shard.add_backend(&mut ctx, d, None, None, 1).unwrap();
    shard.reconfigure(&mut ctx, 200).unwrap();
    ctx.end();

    let mut ctx = rt.ctx();
    let mut moved = 0;
    let mut moved_to_d = 0;
    for (k, old) in keys.iter().zip(&before) {
        ctx.url = k.clone();
        let new = shard.backend(&mut ctx, &by_url()).unwrap().unwrap().name.clone();
        if &new != old {
            moved += 1;
            if new == "d" {
                moved_to_d += 1;
            }
        }
    }
    ctx.end();

    // Expected remap fraction ~1/4; any key that moved moved to the new
    // backend.
    assert_eq!(moved, moved_to_d, "keys may only move to the added backend");
    let frac = moved as f64 / keys.len() as f64;
    assert!(
        (0.10..0.45).contains(&frac),
        "remap fraction {frac} implausible for 3->4 backends"
    );
    rt.shutdown();
}

#[test]
fn test_alt_selects_a_different_host() {
    let (_d, rt) = mk_runtime();
    let shard = ShardDirector::new("s6", rt.lock_class("shard"), 0.0);
    populate(&rt, &shard, &[("a", 7700), ("b", 7701), ("c", 7702)], 100);

    let mut ctx = rt.ctx();
    ctx.url = "some-key".to_string();
    let primary = shard
        .backend(&mut ctx, &by_url())
        .unwrap()
        .unwrap();
    let alt1 = ShardParam {
        by: Some(HashBy::Url),
        alt: Some(1),
        ..Default::default()
    };
    let secondary = shard.backend(&mut ctx, &alt1).unwrap().unwrap();
    assert!(
        !Arc::ptr_eq(&primary, &secondary),
        "alt=1 must skip the primary host"
    );
    ctx.end();
    rt.shutdown();
}

#[test]
fn test_rampup_defers_fresh_backend() {
    let (_d, rt) = mk_runtime();
    // 1000s default rampup: a just-recovered backend has acceptance
    // probability ~0.
    let shard = ShardDirector::new("s7", rt.lock_class("shard"), 1000.0);
    let a = mk_backend(&rt, "a", 7800);
    let b = mk_backend(&rt, "b", 7801);
    {
        // b carries a per-slot rampup of 0 so only a fades in.
        let mut ctx = rt.ctx();
        shard
            .add_backend(&mut ctx, Arc::clone(&a), None, None, 1)
            .unwrap();
        shard
            .add_backend(&mut ctx, Arc::clone(&b), None, Some(0.0), 1)
            .unwrap();
        shard.reconfigure(&mut ctx, 100).unwrap();
        ctx.end();
    }

    // Flap a: its became_healthy is now.
    a.set_admin_health(AdminHealth::Sick, vtim::real_now());
    a.set_admin_health(AdminHealth::Healthy, vtim::real_now());

    let mut ctx = rt.ctx();
    // Find a key whose primary is a, then watch rampup push it to b.
    let mut key = None;
    let ignore_ramp = ShardParam {
        by: Some(HashBy::Url),
        rampup: Some(false),
        ..Default::default()
    };
    for i in 0..100 {
        ctx.url = format!("probe-{i}");
        let p = shard.backend(&mut ctx, &ignore_ramp).unwrap().unwrap();
        if p.name == "a" {
            key = Some(ctx.url.clone());
            break;
        }
    }
    let key = key.expect("some key maps to a");

    ctx.url = key.clone();
    for _ in 0..30 {
        let picked = shard.backend(&mut ctx, &by_url()).unwrap().unwrap();
        assert_eq!(picked.name, "b", "rampup at t=0 defers to the next host");
    }
    // With rampup off the primary is served immediately.
    let p = shard.backend(&mut ctx, &ignore_ramp).unwrap().unwrap();
    assert_eq!(p.name, "a");
    ctx.end();
    rt.shutdown();
}

#[test]
fn test_warmup_biases_towards_secondary() {
    let (_d, rt) = mk_runtime();
    let shard = ShardDirector::new("s8", rt.lock_class("shard"), 0.0);
    populate(&rt, &shard, &[("a", 7900), ("b", 7901)], 100);

    let mut ctx = rt.ctx();
    ctx.url = "warm-key".to_string();
    let primary = shard
        .backend(&mut ctx, &by_url())
        .unwrap()
        .unwrap();

    let warm = ShardParam {
        by: Some(HashBy::Url),
        warmup: Some(0.95),
        ..Default::default()
    };
    let mut secondary_hits = 0;
    for _ in 0..200 {
        let p = shard.backend(&mut ctx, &warm).unwrap().unwrap();
        if !Arc::ptr_eq(&p, &primary) {
            secondary_hits += 1;
        }
    }
    assert!(
        secondary_hits > 150,
        "warmup 0.95 sent only {secondary_hits}/200 to the secondary"
    );
    ctx.end();
    rt.shutdown();
}

#[test]
fn test_key_derivation_modes() {
    let (_d, rt) = mk_runtime();
    let shard = ShardDirector::new("s9", rt.lock_class("shard"), 0.0);
    populate(&rt, &shard, &[("a", 8000), ("b", 8001), ("c", 8002)], 100);

    let mut ctx = rt.ctx();
    // KEY and BLOB with the same 4 bytes agree.
    let by_key = ShardParam {
        by: Some(HashBy::Key),
        key: Some(0xdead_beef),
        ..Default::default()
    };
    let by_blob = ShardParam {
        by: Some(HashBy::Blob),
        key_blob: Some(vec![0xde, 0xad, 0xbe, 0xef, 0x99]),
        ..Default::default()
    };
    let k = shard.backend(&mut ctx, &by_key).unwrap().unwrap();
    let b = shard.backend(&mut ctx, &by_blob).unwrap().unwrap();
    assert!(Arc::ptr_eq(&k, &b));

    // HASH uses the request digest.
    ctx.digest[..4].copy_from_slice(&0xdead_beefu32.to_be_bytes());
    let h = shard
        .backend(&mut ctx, &ShardParam::default())
        .unwrap()
        .unwrap();
    assert!(Arc::ptr_eq(&k, &h));
    ctx.end();
    rt.shutdown();
}

#[test]
fn test_task_param_layer() {
    let (_d, rt) = mk_runtime();
    let shard = ShardDirector::new("s10", rt.lock_class("shard"), 0.0);
    populate(&rt, &shard, &[("a", 8100), ("b", 8102), ("c", 8103)], 100);

    let mut ctx = rt.ctx();
    ctx.url = "layered".to_string();
    let base = shard.backend(&mut ctx, &by_url()).unwrap().unwrap();

    // A task-scope alt=1 shifts every pick of this task.
    shard
        .set_task_param(
            &mut ctx,
            ShardParam {
                by: Some(HashBy::Url),
                alt: Some(1),
                ..Default::default()
            },
        )
        .unwrap();
    let shifted = shard
        .backend(&mut ctx, &ShardParam::default())
        .unwrap()
        .unwrap();
    assert!(!Arc::ptr_eq(&base, &shifted));

    // Call-site args still override the task layer.
    let call = ShardParam {
        by: Some(HashBy::Url),
        alt: Some(0),
        ..Default::default()
    };
    let back = shard.backend(&mut ctx, &call).unwrap().unwrap();
    assert!(Arc::ptr_eq(&base, &back));
    ctx.end();
    rt.shutdown();
}
