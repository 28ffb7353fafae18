use polycubes::cache_reader::{CacheReader, CubeSource};
use polycubes::compressed::CompressedCube;
use polycubes::cube::Cube;
use polycubes::enumerate::{cache_path, gen, split_cache_path, GenOptions};
use polycubes::sharded_index::generate_shapes;

#[test]
fn n7_writes_a_cache_that_reloads_to_1023_connected_cubes() {
    let tmp = tempfile::tempdir().unwrap();
    let mut opts = GenOptions::new(tmp.path());
    opts.threads = 2;
    opts.write_cache = true;

    assert_eq!(gen(7, &opts).unwrap(), 1023);

    let reader = CacheReader::load(&cache_path(tmp.path(), 7)).unwrap();
    assert_eq!(reader.size(), 1023);
    assert_eq!(reader.n(), 7);

    let mut seen = 0u64;
    for i in 0..reader.num_shapes() {
        let range = reader.cubes_by_shape(i);
        let shape = range.shape();
        for cube in range.iter() {
            assert_eq!(cube.size(), 7);
            assert_eq!(cube.shape(), shape);
            // decode(encode(c)) gives back the same multiset
            let enc = CompressedCube::encode(&cube).unwrap();
            let dec = enc.decode(7, cube.coords()[0]);
            assert_eq!(dec, cube);
            seen += 1;
        }
    }
    assert_eq!(seen, 1023);
}

#[test]
fn a_run_resumes_from_the_previous_size_cache() {
    let tmp = tempfile::tempdir().unwrap();
    let mut opts = GenOptions::new(tmp.path());
    opts.threads = 2;
    opts.use_cache = true;
    opts.write_cache = true;

    assert_eq!(gen(5, &opts).unwrap(), 29);
    assert!(cache_path(tmp.path(), 4).exists());
    assert!(cache_path(tmp.path(), 5).exists());

    // the next size up maps the cache instead of recomputing the chain
    assert_eq!(gen(6, &opts).unwrap(), 166);

    // intermediate storage files are gone, only caches remain
    let leftovers: Vec<_> = std::fs::read_dir(tmp.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .filter(|name| name.starts_with("storage_"))
        .collect();
    assert!(leftovers.is_empty(), "leaked storage files: {:?}", leftovers);
}

#[test]
fn corrupt_cache_is_ignored_and_recomputed() {
    let tmp = tempfile::tempdir().unwrap();
    let mut opts = GenOptions::new(tmp.path());
    opts.use_cache = true;

    std::fs::create_dir_all(tmp.path()).unwrap();
    std::fs::write(cache_path(tmp.path(), 4), b"not a cache file").unwrap();
    assert_eq!(gen(4, &opts).unwrap(), 8);
}

#[test]
fn split_cache_mode_round_trips_between_sizes() {
    let tmp = tempfile::tempdir().unwrap();
    let mut opts = GenOptions::new(tmp.path());
    opts.threads = 2;
    opts.split_cache = true;

    assert_eq!(gen(4, &opts).unwrap(), 8);
    let with_cubes: Vec<_> = generate_shapes(4)
        .into_iter()
        .filter(|&s| split_cache_path(tmp.path(), 4, s).exists())
        .collect();
    assert!(!with_cubes.is_empty());

    // every nonempty shape file is a valid single-shape cache
    let mut total = 0;
    for s in &with_cubes {
        let reader = CacheReader::load(&split_cache_path(tmp.path(), 4, *s)).unwrap();
        assert_eq!(reader.n(), 4);
        assert_eq!(reader.num_shapes(), 1);
        total += reader.size();
    }
    assert_eq!(total, 8);

    // N=5 consumes the split files
    opts.use_split_cache = true;
    assert_eq!(gen(5, &opts).unwrap(), 29);
}

#[test]
fn every_enumerated_cube_is_canonical() {
    let tmp = tempfile::tempdir().unwrap();
    let mut opts = GenOptions::new(tmp.path());
    opts.write_cache = true;
    assert_eq!(gen(4, &opts).unwrap(), 8);

    let reader = CacheReader::load(&cache_path(tmp.path(), 4)).unwrap();
    for i in 0..reader.num_shapes() {
        for cube in reader.cubes_by_shape(i).iter() {
            let coords = cube.coords().to_vec();
            let (canon, shape) = polycubes::rotations::canonicalize(&coords);
            assert_eq!(canon, coords, "cache holds a non-canonical cube");
            assert_eq!(shape, cube.shape());
            let mut sorted = coords.clone();
            sorted.sort();
            assert_eq!(sorted, coords, "cache cube is not sorted");
        }
    }

    // the streaming flavor agrees with the mapped one
    let streamed: Vec<Cube> = (0..reader.num_shapes())
        .flat_map(|i| reader.cubes_by_shape_streaming(i).iter().collect::<Vec<_>>())
        .collect();
    let mapped: Vec<Cube> = (0..reader.num_shapes())
        .flat_map(|i| reader.cubes_by_shape(i).iter().collect::<Vec<_>>())
        .collect();
    assert_eq!(streamed, mapped);
}
