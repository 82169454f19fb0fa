use crate::common::sh_floats_for_degree;
use crate::error::SplatError;
use crate::geom::Aabb;
use glam::Vec3;

/// Per-degree splat ceilings. Downstream consumers pack attributes into
/// fixed-size GPU textures; higher harmonic degrees need more texels per
/// splat, so the ceiling shrinks with degree.
pub const MAX_SPLATS_SH0: usize = 16_777_216;
pub const MAX_SPLATS_SH1: usize = 11_184_810;
pub const MAX_SPLATS_SH2: usize = 8_388_608;

pub fn capacity_for_degree(sh_degree: u8) -> usize {
    match sh_degree {
        0 => MAX_SPLATS_SH0,
        1 => MAX_SPLATS_SH1,
        _ => MAX_SPLATS_SH2,
    }
}

/// Column-wise attribute arrays for one section, produced by an ingestion
/// parser or the codec. Positions/scales are xyz triples, rotations are
/// xyzw quaternions, colors are RGBA bytes with opacity in the A channel,
/// spherical harmonics are coefficient-major RGB triples.
#[derive(Debug, Default, Clone)]
pub struct SectionData {
    pub positions: Vec<f32>,
    pub scales: Vec<f32>,
    pub rotations: Vec<f32>,
    pub colors: Vec<u8>,
    pub sh: Vec<f32>,
}

impl SectionData {
    pub fn with_capacity(count: usize, sh_degree: u8) -> Self {
        Self {
            positions: Vec::with_capacity(count * 3),
            scales: Vec::with_capacity(count * 3),
            rotations: Vec::with_capacity(count * 4),
            colors: Vec::with_capacity(count * 4),
            sh: Vec::with_capacity(count * sh_floats_for_degree(sh_degree)),
        }
    }

    pub fn push_splat(
        &mut self,
        position: [f32; 3],
        scale: [f32; 3],
        rotation: [f32; 4],
        color: [u8; 4],
        sh: &[f32],
    ) {
        self.positions.extend_from_slice(&position);
        self.scales.extend_from_slice(&scale);
        self.rotations.extend_from_slice(&rotation);
        self.colors.extend_from_slice(&color);
        self.sh.extend_from_slice(sh);
    }

    /// Splat count implied by the column lengths, or an error when the
    /// columns disagree for the given harmonics degree.
    pub fn splat_count(&self, sh_degree: u8) -> Result<usize, SplatError> {
        if self.positions.len() % 3 != 0 {
            return Err(SplatError::MalformedInput(
                "position column length is not a multiple of 3".to_string(),
            ));
        }
        let count = self.positions.len() / 3;
        let sh_len = count * sh_floats_for_degree(sh_degree);
        if self.scales.len() != count * 3
            || self.rotations.len() != count * 4
            || self.colors.len() != count * 4
            || self.sh.len() != sh_len
        {
            return Err(SplatError::MalformedInput(format!(
                "attribute columns disagree for {} splats at SH degree {}",
                count, sh_degree
            )));
        }
        Ok(count)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionId(pub u32);

/// A sealed span of splats. Sections never resize after append; growth
/// happens only by appending further sections.
#[derive(Debug, Clone)]
pub struct Section {
    base: usize,
    count: usize,
    bounds: Aabb,
}

impl Section {
    pub fn base(&self) -> usize {
        self.base
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn bounds(&self) -> &Aabb {
        &self.bounds
    }

    pub fn range(&self) -> std::ops::Range<usize> {
        self.base..self.base + self.count
    }
}

/// Read-only view of one splat's attributes.
#[derive(Debug, Clone, Copy)]
pub struct SplatRef<'a> {
    pub position: [f32; 3],
    pub scale: [f32; 3],
    pub rotation: [f32; 4],
    pub color: [u8; 4],
    pub sh: &'a [f32],
}

/// Canonical container for all splat data: contiguous attribute columns
/// partitioned into sealed sections. Global indices are assigned at append
/// time and never reused; every structural mutation bumps the generation
/// counter so readers can detect stale snapshots.
#[derive(Debug)]
pub struct SplatStore {
    sh_degree: u8,
    positions: Vec<f32>,
    scales: Vec<f32>,
    rotations: Vec<f32>,
    colors: Vec<u8>,
    sh: Vec<f32>,
    sections: Vec<Section>,
    generation: u64,
}

impl SplatStore {
    pub fn new(sh_degree: u8) -> Self {
        Self {
            sh_degree: sh_degree.min(2),
            positions: Vec::new(),
            scales: Vec::new(),
            rotations: Vec::new(),
            colors: Vec::new(),
            sh: Vec::new(),
            sections: Vec::new(),
            generation: 0,
        }
    }

    pub fn sh_degree(&self) -> u8 {
        self.sh_degree
    }

    pub fn total_count(&self) -> usize {
        self.positions.len() / 3
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn positions(&self) -> &[f32] {
        &self.positions
    }

    pub fn scales(&self) -> &[f32] {
        &self.scales
    }

    pub fn rotations(&self) -> &[f32] {
        &self.rotations
    }

    pub fn colors(&self) -> &[u8] {
        &self.colors
    }

    pub fn sh(&self) -> &[f32] {
        &self.sh
    }

    #[inline]
    pub fn position(&self, index: usize) -> Vec3 {
        let p = &self.positions[index * 3..index * 3 + 3];
        Vec3::new(p[0], p[1], p[2])
    }

    /// Opacity column extracted from the RGBA colors, one byte per splat.
    pub fn opacities(&self) -> Vec<u8> {
        self.colors.chunks_exact(4).map(|c| c[3]).collect()
    }

    /// Appends a sealed section. Fails with `CapacityExceeded` when the
    /// store would outgrow the degree-dependent ceiling. Any octree built
    /// over this store is stale afterwards until rebuilt.
    pub fn append_section(&mut self, data: SectionData) -> Result<SectionId, SplatError> {
        let count = data.splat_count(self.sh_degree)?;
        if count == 0 {
            return Err(SplatError::EmptySection);
        }
        let ceiling = capacity_for_degree(self.sh_degree);
        let requested = self.total_count() + count;
        if requested > ceiling {
            return Err(SplatError::CapacityExceeded {
                requested,
                ceiling,
                sh_degree: self.sh_degree,
            });
        }

        let bounds = Aabb::from_positions(data.positions.chunks_exact(3));
        let base = self.total_count();
        self.positions.extend_from_slice(&data.positions);
        self.scales.extend_from_slice(&data.scales);
        self.rotations.extend_from_slice(&data.rotations);
        self.colors.extend_from_slice(&data.colors);
        self.sh.extend_from_slice(&data.sh);
        self.sections.push(Section {
            base,
            count,
            bounds,
        });
        self.generation += 1;
        tracing::debug!(
            section = self.sections.len() - 1,
            splats = count,
            total = requested,
            "appended section"
        );
        Ok(SectionId(self.sections.len() as u32 - 1))
    }

    pub fn section_bounds(&self, id: SectionId) -> Option<&Aabb> {
        self.sections.get(id.0 as usize).map(|s| &s.bounds)
    }

    /// Union of all section bounds.
    pub fn bounds(&self) -> Aabb {
        let mut bounds = Aabb::empty();
        for s in &self.sections {
            bounds.union(&s.bounds);
        }
        bounds
    }

    pub fn get(&self, index: usize) -> Option<SplatRef<'_>> {
        if index >= self.total_count() {
            return None;
        }
        let sh_len = sh_floats_for_degree(self.sh_degree);
        Some(SplatRef {
            position: self.positions[index * 3..index * 3 + 3].try_into().unwrap(),
            scale: self.scales[index * 3..index * 3 + 3].try_into().unwrap(),
            rotation: self.rotations[index * 4..index * 4 + 4].try_into().unwrap(),
            color: self.colors[index * 4..index * 4 + 4].try_into().unwrap(),
            sh: &self.sh[index * sh_len..(index + 1) * sh_len],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section_of(points: &[[f32; 3]]) -> SectionData {
        let mut data = SectionData::with_capacity(points.len(), 0);
        for (i, p) in points.iter().enumerate() {
            data.push_splat(*p, [0.1, 0.1, 0.1], [0.0, 0.0, 0.0, 1.0], [10, 20, 30, i as u8 + 1], &[]);
        }
        data
    }

    #[test]
    fn append_assigns_stable_global_indices() {
        let mut store = SplatStore::new(0);
        let a = store
            .append_section(section_of(&[[0.0, 0.0, 0.0], [1.0, 0.0, 0.0]]))
            .expect("first append");
        let b = store
            .append_section(section_of(&[[5.0, 5.0, 5.0]]))
            .expect("second append");
        assert_eq!(a, SectionId(0));
        assert_eq!(b, SectionId(1));
        assert_eq!(store.total_count(), 3);
        assert_eq!(store.sections()[1].base(), 2);
        let third = store.get(2).expect("global index 2");
        assert_eq!(third.position, [5.0, 5.0, 5.0]);
    }

    #[test]
    fn append_bumps_generation_and_bounds() {
        let mut store = SplatStore::new(0);
        assert_eq!(store.generation(), 0);
        store
            .append_section(section_of(&[[0.0, -1.0, 0.0], [2.0, 3.0, 4.0]]))
            .expect("append");
        assert_eq!(store.generation(), 1);
        let bounds = store.section_bounds(SectionId(0)).expect("bounds");
        assert_eq!(bounds.min, Vec3::new(0.0, -1.0, 0.0));
        assert_eq!(bounds.max, Vec3::new(2.0, 3.0, 4.0));
    }

    #[test]
    fn mismatched_columns_are_rejected() {
        let mut store = SplatStore::new(0);
        let mut data = section_of(&[[0.0, 0.0, 0.0]]);
        data.scales.pop();
        let err = store.append_section(data).expect_err("bad columns");
        assert!(matches!(err, SplatError::MalformedInput(_)));
    }

    #[test]
    fn empty_sections_are_rejected() {
        let mut store = SplatStore::new(0);
        let err = store
            .append_section(SectionData::default())
            .expect_err("empty");
        assert!(matches!(err, SplatError::EmptySection));
    }

    #[test]
    fn opacity_column_tracks_alpha_channel() {
        let mut store = SplatStore::new(0);
        store
            .append_section(section_of(&[[0.0; 3], [1.0; 3], [2.0; 3]]))
            .expect("append");
        assert_eq!(store.opacities(), vec![1, 2, 3]);
    }
}
