//! Child cache hierarchies: creation, typing, parameters and invalidation.

use std::collections::BTreeSet;
use std::rc::Rc;

use prism_session::{
    ChildCacheName, EvalError, Evaluator, Feature, FeatureSet, SessionCache, SessionError,
    SessionParams,
};

struct Image {
    pixels: Vec<f64>,
}

struct Tile {
    values: Vec<f64>,
}

struct ImageEvaluator;

impl Evaluator<Image> for ImageEvaluator {
    fn evaluate(
        &self,
        _feature: &Feature,
        input: &Image,
        _session: &SessionCache<Image>,
    ) -> Result<f64, EvalError> {
        Ok(input.pixels.iter().sum())
    }
}

struct TileEvaluator;

impl Evaluator<Tile> for TileEvaluator {
    fn evaluate(
        &self,
        _feature: &Feature,
        input: &Tile,
        _session: &SessionCache<Tile>,
    ) -> Result<f64, EvalError> {
        Ok(input.values.iter().sum())
    }
}

fn image_session() -> (SessionCache<Image>, Feature) {
    let mut set = FeatureSet::new();
    let total = set.declare("total").unwrap();
    let session = SessionCache::new(Rc::new(ImageEvaluator), Rc::new(set));
    (session, total)
}

fn tile_cache() -> SessionCache<Tile> {
    let mut set = FeatureSet::new();
    set.declare("total").unwrap();
    SessionCache::new(Rc::new(TileEvaluator), Rc::new(set))
}

#[test]
fn same_name_returns_the_same_child() {
    let (session, _total) = image_session();
    let first = session.child_cache_for("tiles", tile_cache).unwrap();
    let second = session
        .child_cache_for::<Tile>("tiles", || panic!("factory must not rerun"))
        .unwrap();
    assert!(Rc::ptr_eq(&first, &second));
    assert_eq!(session.child_names(), [ChildCacheName::new("tiles")]);
    assert!(session.has_child("tiles"));
    assert!(!session.has_child("bands"));
}

#[test]
fn type_mismatch_is_an_error_and_keeps_the_stored_child() {
    let (session, _total) = image_session();
    let original = session.child_cache_for("tiles", tile_cache).unwrap();

    let err = session
        .child_cache_for::<Image>("tiles", || panic!("factory must not run on mismatch"))
        .unwrap_err();
    match err {
        SessionError::ChildCacheTypeMismatch { name } => assert_eq!(name.as_str(), "tiles"),
        other => panic!("expected ChildCacheTypeMismatch, got {other:?}"),
    }

    // The original child survives under its original type.
    let again = session
        .child_cache_for::<Tile>("tiles", || panic!("still cached"))
        .unwrap();
    assert!(Rc::ptr_eq(&original, &again));
}

#[test]
fn children_created_after_init_inherit_params() {
    let (session, _total) = image_session();
    session.init(Rc::new(SessionParams::with_label("case-9")));

    let child = session.child_cache_for("tiles", tile_cache).unwrap();
    assert!(child.is_initialized());
    assert_eq!(child.params().unwrap().label.as_deref(), Some("case-9"));
}

#[test]
fn children_created_before_init_are_bound_at_init() {
    let (session, _total) = image_session();
    let child = session.child_cache_for("tiles", tile_cache).unwrap();
    assert!(!child.is_initialized());

    session.init(Rc::new(SessionParams::with_label("late")));
    assert!(child.is_initialized());
    assert_eq!(child.params().unwrap().label.as_deref(), Some("late"));
}

#[test]
fn reinit_rebinds_child_params() {
    let (session, _total) = image_session();
    session.init(Rc::new(SessionParams::with_label("first")));
    let child = session.child_cache_for("tiles", tile_cache).unwrap();

    session.init(Rc::new(SessionParams::with_label("second")));
    assert_eq!(child.params().unwrap().label.as_deref(), Some("second"));
}

#[test]
fn invalidate_reaches_children() {
    let (session, total) = image_session();
    session.init(Rc::new(SessionParams::new()));
    let child = session.child_cache_for("tiles", tile_cache).unwrap();

    session.calc(&total, &Image { pixels: vec![1.0] }).unwrap();
    child
        .calc_by_identifier("total", &Tile { values: vec![2.0] })
        .unwrap();

    session.invalidate();
    assert_eq!(session.cached_value(&total), None);
    assert_eq!(child.cached_value_for_identifier("total"), None);
    assert_eq!(child.stats().invalidations, 1);
}

#[test]
fn invalidate_except_protects_named_children() {
    let (session, total) = image_session();
    session.init(Rc::new(SessionParams::new()));
    let hot = session.child_cache_for("hot", tile_cache).unwrap();
    let cold = session.child_cache_for("cold", tile_cache).unwrap();

    session.calc(&total, &Image { pixels: vec![1.0] }).unwrap();
    hot.calc_by_identifier("total", &Tile { values: vec![2.0] })
        .unwrap();
    cold.calc_by_identifier("total", &Tile { values: vec![3.0] })
        .unwrap();

    let protected = BTreeSet::from([ChildCacheName::new("hot")]);
    session.invalidate_except(&protected);

    // The parent's own scope always resets.
    assert_eq!(session.cached_value(&total), None);
    assert_eq!(hot.cached_value_for_identifier("total"), Some(2.0));
    assert_eq!(cold.cached_value_for_identifier("total"), None);
}

#[test]
fn protecting_a_child_protects_its_subtree() {
    let (session, _total) = image_session();
    session.init(Rc::new(SessionParams::new()));
    let mid = session.child_cache_for("mid", tile_cache).unwrap();
    let leaf = mid.child_cache_for("leaf", tile_cache).unwrap();

    leaf.calc_by_identifier("total", &Tile { values: vec![7.0] })
        .unwrap();

    session.invalidate_except(&BTreeSet::from([ChildCacheName::new("mid")]));
    assert_eq!(leaf.cached_value_for_identifier("total"), Some(7.0));

    session.invalidate();
    assert_eq!(leaf.cached_value_for_identifier("total"), None);
}

/// Evaluator that splits the image in half and delegates to per-tile child
/// caches created on demand, mid-evaluation.
struct DelegatingEvaluator;

impl Evaluator<Image> for DelegatingEvaluator {
    fn evaluate(
        &self,
        feature: &Feature,
        input: &Image,
        session: &SessionCache<Image>,
    ) -> Result<f64, EvalError> {
        match feature.to_string().as_str() {
            "halves_sum" => {
                let mid = input.pixels.len() / 2;
                let halves = [&input.pixels[..mid], &input.pixels[mid..]];
                let mut sum = 0.0;
                for (idx, values) in halves.iter().enumerate() {
                    let child = session
                        .child_cache_for(format!("half.{idx}"), tile_cache)
                        .map_err(|err| EvalError::with_source("child cache unavailable", err))?;
                    let tile = Tile {
                        values: values.to_vec(),
                    };
                    sum += child
                        .calc_by_identifier("total", &tile)
                        .map_err(|err| EvalError::with_source("tile total failed", err))?;
                }
                Ok(sum)
            }
            other => Err(EvalError::new(format!("no rule for {other}"))),
        }
    }
}

#[test]
fn evaluators_can_create_children_mid_evaluation() {
    let mut set = FeatureSet::new();
    let halves_sum = set.declare("halves_sum").unwrap();
    let session = SessionCache::new(Rc::new(DelegatingEvaluator), Rc::new(set));
    session.init(Rc::new(SessionParams::with_label("split")));

    let image = Image {
        pixels: vec![1.0, 2.0, 3.0, 4.0],
    };
    assert_eq!(session.calc(&halves_sum, &image).unwrap(), 10.0);

    let names: Vec<_> = session
        .child_names()
        .iter()
        .map(|n| n.as_str().to_owned())
        .collect();
    assert_eq!(names, ["half.0", "half.1"]);

    // Children created mid-evaluation were bound to the session params.
    let half = session
        .child_cache_for::<Tile>("half.0", || panic!("already created"))
        .unwrap();
    assert_eq!(half.params().unwrap().label.as_deref(), Some("split"));
    assert_eq!(half.cached_value_for_identifier("total"), Some(3.0));
}
