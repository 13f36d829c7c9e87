//! Coordinate and frame-property extraction
//!
//! Pulls the positions of one or more atom groups, and optionally the frame
//! time and box dimensions, out of every frame of a window into contiguous
//! float32 arrays. Groups may overlap: only the sorted union of their atoms
//! is stored, and each group keeps indices relative to that union.
//!
//! Extraction always partitions in block mode, so the output is already in
//! frame order.

use crate::comm::Coordinator;
use crate::config::{FrameWindow, ParallelConfig};
use crate::engine::{AggregatedResult, Engine};
use crate::error::{ConfigError, Result};
use crate::partition::PartitionMode;
use crate::registry::{ComputeResult, Registry};
use crate::schema::{NumericKind, NumericSpec, ResultSchema, Value};
use crate::trajectory::{Frame, TrajectorySource};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

const COORDS: &str = "coords";

/// Per-frame properties that can be extracted alongside coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Property {
    /// Frame time in ps (float32 scalar), NaN for frames without one
    Time,
    /// Box `[a, b, c, alpha, beta, gamma]` (float32 [6])
    Dimensions,
}

impl Property {
    pub fn name(self) -> &'static str {
        match self {
            Property::Time => "time",
            Property::Dimensions => "dimensions",
        }
    }

    fn schema(self) -> ResultSchema {
        let shape = match self {
            Property::Time => vec![],
            Property::Dimensions => vec![6],
        };
        ResultSchema::Numeric(NumericSpec::new(NumericKind::F32, shape))
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Property {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "time" => Ok(Property::Time),
            "dimensions" => Ok(Property::Dimensions),
            other => Err(ConfigError::InvalidSelection(format!(
                "'{other}' is not an extractable frame property"
            ))),
        }
    }
}

/// Which of x, y and z to keep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisMask {
    pub x: bool,
    pub y: bool,
    pub z: bool,
}

impl Default for AxisMask {
    fn default() -> Self {
        Self {
            x: true,
            y: true,
            z: true,
        }
    }
}

impl AxisMask {
    /// Kept axis indices, in x, y, z order
    pub fn axes(&self) -> Vec<usize> {
        [self.x, self.y, self.z]
            .iter()
            .enumerate()
            .filter_map(|(axis, &keep)| keep.then_some(axis))
            .collect()
    }

    pub fn count(&self) -> usize {
        self.axes().len()
    }
}

/// What to extract
///
/// A request with neither groups nor properties extracts every atom.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeseriesRequest {
    /// Atom index groups
    pub groups: Vec<Vec<u32>>,
    pub props: Vec<Property>,
    pub axes: AxisMask,
}

impl TimeseriesRequest {
    pub fn new(groups: Vec<Vec<u32>>) -> Self {
        Self {
            groups,
            ..Self::default()
        }
    }

    /// Only frame properties, no coordinates
    pub fn properties(props: Vec<Property>) -> Self {
        Self {
            props,
            ..Self::default()
        }
    }

    pub fn with_props(self, props: Vec<Property>) -> Self {
        Self { props, ..self }
    }

    pub fn with_axes(self, axes: AxisMask) -> Self {
        Self { axes, ..self }
    }
}

/// Sorted union of atom groups plus each group's positions within it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexUnion {
    pub indices: Vec<u32>,
    pub relative: Vec<Vec<usize>>,
}

impl IndexUnion {
    pub fn new(groups: &[Vec<u32>]) -> Self {
        let mut indices: Vec<u32> = groups.iter().flatten().copied().collect();
        indices.sort_unstable();
        indices.dedup();
        let relative = groups
            .iter()
            .map(|group| {
                group
                    .iter()
                    .filter_map(|atom| indices.binary_search(atom).ok())
                    .collect()
            })
            .collect();
        Self { indices, relative }
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Extracted arrays, one row per frame
#[derive(Debug)]
pub struct Timeseries {
    union: IndexUnion,
    axes: AxisMask,
    result: AggregatedResult,
}

impl Timeseries {
    /// Global index of every row
    pub fn frames(&self) -> &[usize] {
        &self.result.frames
    }

    /// Atoms stored, as the sorted union of the requested groups
    pub fn atoms(&self) -> &[u32] {
        &self.union.indices
    }

    /// Positions of each requested group within [`Timeseries::atoms`]
    pub fn relative_indices(&self) -> &[Vec<usize>] {
        &self.union.relative
    }

    pub fn axes(&self) -> AxisMask {
        self.axes
    }

    /// All coordinates, laid out `[frame][atom][axis]`
    pub fn coords(&self) -> Option<&[f32]> {
        self.result.get(COORDS)?.values(0)
    }

    /// Coordinates of one group, laid out `[frame][group atom][axis]`
    pub fn group(&self, group: usize) -> Option<Vec<f32>> {
        let relative = self.union.relative.get(group)?;
        let coords = self.coords()?;
        let n_axes = self.axes.count();
        let row = self.union.len() * n_axes;
        if row == 0 {
            return Some(Vec::new());
        }

        let mut out = Vec::with_capacity(coords.len() / row * relative.len() * n_axes);
        for frame in coords.chunks_exact(row) {
            for &atom in relative {
                out.extend_from_slice(&frame[atom * n_axes..(atom + 1) * n_axes]);
            }
        }
        Some(out)
    }

    /// Values of an extracted property, `dimensions` laid out `[frame][6]`
    pub fn property(&self, prop: Property) -> Option<&[f32]> {
        self.result.get(prop.name())?.values(0)
    }

    pub fn into_result(self) -> AggregatedResult {
        self.result
    }
}

fn coordinates(
    indices: Arc<[u32]>,
    axes: Vec<usize>,
) -> impl FnMut(&Frame, &[Value]) -> ComputeResult<Value> + Clone + Send + 'static {
    move |frame: &Frame, _: &[Value]| -> ComputeResult<Value> {
        let selected = frame.select(&indices).ok_or_else(|| {
            format!(
                "frame {} has {} atoms, selection reaches atom {}",
                frame.index,
                frame.n_atoms(),
                indices.last().copied().unwrap_or_default()
            )
        })?;
        let data = selected
            .iter()
            .flat_map(|p| axes.iter().map(move |&axis| p[axis]))
            .collect();
        Ok(Value::array_f32(vec![indices.len(), axes.len()], data))
    }
}

fn time(frame: &Frame, _: &[Value]) -> ComputeResult<Value> {
    Ok(Value::F32(frame.time.unwrap_or(f32::NAN)))
}

fn dimensions(frame: &Frame, _: &[Value]) -> ComputeResult<Value> {
    Ok(Value::array_f32(vec![6], frame.dimensions.to_vec()))
}

/// Register the computations for `request`, checked against `n_atoms`
fn build(request: &TimeseriesRequest, n_atoms: usize) -> Result<(Registry, IndexUnion)> {
    let union = if request.groups.is_empty() && request.props.is_empty() {
        IndexUnion::new(&[(0..n_atoms as u32).collect::<Vec<u32>>()])
    } else {
        IndexUnion::new(&request.groups)
    };
    if let Some(&last) = union.indices.last() {
        if last as usize >= n_atoms {
            return Err(ConfigError::InvalidSelection(format!(
                "atom {last} requested but the trajectory has {n_atoms} atoms"
            ))
            .into());
        }
    }

    let axes = request.axes.axes();
    let mut registry = Registry::new();
    if !union.is_empty() {
        if axes.is_empty() {
            return Err(ConfigError::InvalidSelection("no coordinate axes selected".into()).into());
        }
        let schema =
            ResultSchema::Numeric(NumericSpec::new(NumericKind::F32, vec![union.len(), axes.len()]));
        let indices: Arc<[u32]> = union.indices.clone().into();
        registry.register_with_schema(Some(COORDS), coordinates(indices, axes), vec![], schema);
    }
    for &prop in &request.props {
        if registry.contains(prop.name()) {
            continue;
        }
        match prop {
            Property::Time => registry.register_with_schema(Some(prop.name()), time, vec![], prop.schema()),
            Property::Dimensions => {
                registry.register_with_schema(Some(prop.name()), dimensions, vec![], prop.schema())
            }
        };
    }
    debug!(
        atoms = union.len(),
        groups = union.relative.len(),
        props = request.props.len(),
        "Timeseries request"
    );
    Ok((registry, union))
}

fn atom_count(source: &dyn TrajectorySource) -> Result<usize> {
    if source.total_frames() == 0 {
        return Err(ConfigError::EmptyTrajectory.into());
    }
    Ok(source.reopen()?.frame_at(0)?.n_atoms())
}

fn block_only(config: ParallelConfig) -> ParallelConfig {
    config.with_mode(PartitionMode::Block).with_overlap(0)
}

/// Extract `request` from every frame of `window`, serially or on threads
pub fn extract(
    request: &TimeseriesRequest,
    config: ParallelConfig,
    window: FrameWindow,
    source: &dyn TrajectorySource,
) -> Result<Timeseries> {
    let (mut registry, union) = build(request, atom_count(source)?)?;
    let result = Engine::new(block_only(config), window).run_parallel(source, &mut registry)?;
    Ok(Timeseries {
        union,
        axes: request.axes,
        result,
    })
}

/// Extract as one rank of a distributed group
///
/// Only root needs to supply `request`; it is broadcast to every rank.
/// Returns `None` on every rank but root.
pub fn extract_distributed(
    request: Option<TimeseriesRequest>,
    coordinator: &mut Coordinator,
    config: ParallelConfig,
    window: FrameWindow,
    source: &dyn TrajectorySource,
) -> Result<Option<Timeseries>> {
    let request = coordinator.broadcast(request)?;
    let (mut registry, union) = build(&request, atom_count(source)?)?;
    let result = Engine::new(block_only(config), window).run_distributed(
        coordinator,
        source,
        &mut registry,
    )?;
    Ok(result.map(|result| Timeseries {
        union,
        axes: request.axes,
        result,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalGroup;
    use crate::error::TrajparError;
    use crate::trajectory::MemoryTrajectory;
    use std::thread;
    use tempfile::tempdir;

    #[test]
    fn test_index_union() {
        let union = IndexUnion::new(&[vec![5, 1, 3], vec![3, 7]]);
        assert_eq!(union.indices, vec![1, 3, 5, 7]);
        assert_eq!(union.relative, vec![vec![2, 0, 1], vec![1, 3]]);
    }

    #[test]
    fn test_axis_mask() {
        let mask = AxisMask {
            x: true,
            y: false,
            z: true,
        };
        assert_eq!(mask.axes(), vec![0, 2]);
        assert_eq!(AxisMask::default().count(), 3);
    }

    #[test]
    fn test_property_from_str() {
        assert_eq!("time".parse::<Property>().unwrap(), Property::Time);
        assert_eq!("dimensions".parse::<Property>().unwrap(), Property::Dimensions);
        assert!("velocities".parse::<Property>().is_err());
    }

    #[test]
    fn test_extract_groups_smp() {
        let dir = tempdir().unwrap();
        let mut traj = MemoryTrajectory::synthetic(11, 6, 2.0);
        let request = TimeseriesRequest::new(vec![vec![4, 1], vec![1, 2]])
            .with_props(vec![Property::Time, Property::Dimensions])
            .with_axes(AxisMask {
                x: true,
                y: true,
                z: false,
            });
        // interleaved is overridden
        let config = ParallelConfig::smp(3)
            .with_mode(PartitionMode::Interleaved)
            .with_shm_dir(dir.path().to_path_buf())
            .quiet();

        let ts = extract(&request, config, FrameWindow::all(1), &traj).unwrap();
        assert_eq!(ts.frames(), (0..11).collect::<Vec<_>>().as_slice());
        assert_eq!(ts.atoms(), &[1, 2, 4]);

        let coords = ts.coords().unwrap();
        assert_eq!(coords.len(), 11 * 3 * 2);
        let frame = traj.frame_at(7).unwrap();
        let row = &coords[7 * 6..8 * 6];
        assert_eq!(row[4], frame.positions[4][0]);
        assert_eq!(row[5], frame.positions[4][1]);

        let first = ts.group(0).unwrap();
        assert_eq!(first.len(), 11 * 2 * 2);
        assert_eq!(&first[7 * 4..7 * 4 + 2], &[frame.positions[4][0], frame.positions[4][1]]);
        assert_eq!(&first[7 * 4 + 2..8 * 4], &[frame.positions[1][0], frame.positions[1][1]]);

        assert_eq!(ts.property(Property::Time).unwrap()[7], 14.0);
        assert_eq!(ts.property(Property::Dimensions).unwrap().len(), 11 * 6);
    }

    #[test]
    fn test_empty_request_takes_all_atoms() {
        let dir = tempdir().unwrap();
        let traj = MemoryTrajectory::synthetic(4, 5, 1.0);
        let config = ParallelConfig::serial()
            .with_shm_dir(dir.path().to_path_buf())
            .quiet();
        let ts = extract(&TimeseriesRequest::default(), config, FrameWindow::all(1), &traj).unwrap();
        assert_eq!(ts.atoms().len(), 5);
        assert_eq!(ts.coords().unwrap().len(), 4 * 5 * 3);
        assert!(ts.property(Property::Time).is_none());
    }

    #[test]
    fn test_properties_only() {
        let dir = tempdir().unwrap();
        let traj = MemoryTrajectory::synthetic(4, 5, 1.0);
        let config = ParallelConfig::serial()
            .with_shm_dir(dir.path().to_path_buf())
            .quiet();
        let request = TimeseriesRequest::properties(vec![Property::Time, Property::Time]);
        let ts = extract(&request, config, FrameWindow::all(1), &traj).unwrap();
        assert!(ts.coords().is_none());
        assert_eq!(ts.property(Property::Time).unwrap(), &[0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_time_missing_is_nan() {
        let dir = tempdir().unwrap();
        let traj = MemoryTrajectory::synthetic(3, 2, 0.0);
        let config = ParallelConfig::smp(2)
            .with_shm_dir(dir.path().to_path_buf())
            .quiet();
        let request = TimeseriesRequest::properties(vec![Property::Time, Property::Dimensions]);
        let ts = extract(&request, config, FrameWindow::all(1), &traj).unwrap();
        let time = ts.property(Property::Time).unwrap();
        assert_eq!(time.len(), 3);
        assert!(time.iter().all(|t| t.is_nan()));
        assert_eq!(ts.property(Property::Dimensions).unwrap().len(), 3 * 6);
    }

    #[test]
    fn test_invalid_selection() {
        let dir = tempdir().unwrap();
        let traj = MemoryTrajectory::synthetic(4, 5, 1.0);
        let config = ParallelConfig::serial().with_shm_dir(dir.path().to_path_buf());

        let err = extract(&TimeseriesRequest::new(vec![vec![5]]), config.clone(), FrameWindow::all(1), &traj)
            .unwrap_err();
        assert!(matches!(err, TrajparError::Config(ConfigError::InvalidSelection(_))));

        let no_axes = TimeseriesRequest::new(vec![vec![0]]).with_axes(AxisMask {
            x: false,
            y: false,
            z: false,
        });
        assert!(extract(&no_axes, config, FrameWindow::all(1), &traj).is_err());
    }

    #[test]
    fn test_extract_distributed() {
        let dir = tempdir().unwrap();
        let traj = MemoryTrajectory::synthetic(9, 4, 1.0);
        let handles: Vec<_> = LocalGroup::create(2)
            .into_iter()
            .map(|comm| {
                let traj = traj.clone();
                let dir = dir.path().to_path_buf();
                thread::spawn(move || {
                    let mut coordinator = Coordinator::new(Box::new(comm), false);
                    let request = coordinator
                        .is_root()
                        .then(|| TimeseriesRequest::new(vec![vec![3, 0]]));
                    let config = ParallelConfig::distributed(coordinator.rank(), coordinator.size())
                        .with_shm_dir(dir)
                        .quiet();
                    extract_distributed(request, &mut coordinator, config, FrameWindow::all(1), &traj)
                        .unwrap()
                })
            })
            .collect();

        let mut results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(results.pop().unwrap().is_none());
        let ts = results.pop().unwrap().unwrap();
        assert_eq!(ts.frames().len(), 9);
        assert_eq!(ts.coords().unwrap().len(), 9 * 2 * 3);
        assert_eq!(ts.relative_indices(), &[vec![1, 0]]);
    }
}
