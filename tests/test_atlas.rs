mod common;
use common::{atlas, grid_index, lattice, template, to_template, DIPOLE, SHIFT};
use megparc::{align_source_model, assign_parcels, Error, Interpolation, SourceModel, BACKGROUND};

fn template_grid() -> SourceModel {
    align_source_model(&lattice(), &to_template(), &template()).unwrap()
}

#[test]
fn assignment_is_deterministic() {
    let atlas = atlas();
    let grid = template_grid();
    for method in [Interpolation::Nearest, Interpolation::Majority { radius: 1 }] {
        let a = assign_parcels(&atlas, &grid, method).unwrap();
        let b = assign_parcels(&atlas, &grid, method).unwrap();
        assert_eq!(a, b, "{method:?}");
    }
}

#[test]
fn every_point_gets_exactly_one_label() {
    let atlas = atlas();
    let grid = template_grid();
    let a = assign_parcels(&atlas, &grid, Interpolation::Nearest).unwrap();
    assert_eq!(a.n_points(), grid.n_points());
    assert_eq!(a.grid_fingerprint, grid.fingerprint());

    let total: usize = a.parcels().iter().map(|&l| a.members(l).len()).sum::<usize>()
        + a.members(BACKGROUND).len();
    assert_eq!(total, grid.n_points());
}

#[test]
fn lattice_lands_on_voxel_centres() {
    let atlas = atlas();
    let grid = template_grid();
    let a = assign_parcels(&atlas, &grid, Interpolation::Nearest).unwrap();
    assert_eq!(a.parcels(), vec![1, 2]);
    assert_eq!(a.members(1), vec![grid_index(&lattice(), DIPOLE)]);
    for i in a.members(2) {
        assert!(grid.point(i)[0] < -1e-9 + SHIFT[0], "point {i} is not left");
    }
}

#[test]
fn majority_spreads_labels_into_background_neighbours() {
    // Lattice point one step below the source: background voxel, but its
    // 3×3×3 neighbourhood holds the source voxel and no other label.
    let grid = template_grid();
    let below = grid_index(&lattice(), [DIPOLE[0], DIPOLE[1], DIPOLE[2] - 0.02]);
    let nearest = assign_parcels(&atlas(), &grid, Interpolation::Nearest).unwrap();
    let major = assign_parcels(&atlas(), &grid, Interpolation::Majority { radius: 1 }).unwrap();
    assert_eq!(nearest.labels[below], BACKGROUND);
    assert_eq!(major.labels[below], 1);
}

#[test]
fn grid_far_outside_the_volume_is_background() {
    let far = align_source_model(
        &lattice(),
        &megparc::Affine::translation([1.0, 0.0, 0.0]),
        &template(),
    )
    .unwrap();
    let a = assign_parcels(&atlas(), &far, Interpolation::Nearest).unwrap();
    assert!(a.labels.iter().all(|&l| l == BACKGROUND));
    assert!(a.parcels().is_empty());
}

#[test]
fn native_grid_rejected() {
    let err = assign_parcels(&atlas(), &lattice(), Interpolation::Nearest);
    assert!(matches!(err, Err(Error::Configuration(_))));
}
