//! Tasks moving frames in and out of an [`Adaptor`].

use serde::{Deserialize, Serialize};
use tracing::debug;
use weir_core::{
    Codelet, CoreError, CoreResult, Datatype, Socket, SocketBuffer, SocketDirection, Status, Task,
    TaskIo,
};

use crate::adaptor::{Adaptor, Puller, Pusher};

/// Layout of one stream carried by an adaptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamLayout {
    /// Socket name
    pub name: String,
    /// Element type
    pub datatype: Datatype,
    /// Elements per frame
    pub n_elmts: usize,
}

impl StreamLayout {
    /// Bytes of a single frame
    #[must_use]
    pub const fn frame_bytes(&self) -> usize {
        self.n_elmts * self.datatype.size()
    }
}

fn buffers<'a>(io: &TaskIo<'a>) -> CoreResult<Vec<&'a SocketBuffer>> {
    (0..io.n_sockets()).map(|i| io.buffer(i)).collect()
}

fn stop_on_cancel(result: CoreResult<()>, role: &str, id: usize) -> CoreResult<Status> {
    match result {
        Ok(()) => Ok(Status::Success),
        Err(CoreError::Cancelled) => {
            debug!(role, id, "adaptor wait cancelled");
            Ok(Status::FailureStop)
        }
        Err(e) => Err(e),
    }
}

/// Stores its input sockets into the adaptor
#[derive(Debug)]
pub struct PushCodelet {
    pusher: Pusher,
}

impl Codelet for PushCodelet {
    fn exec(&mut self, io: &mut TaskIo<'_>, _frame_id: u64) -> CoreResult<Status> {
        let streams = buffers(io)?;
        stop_on_cancel(self.pusher.push(&streams), "pusher", self.pusher.id())
    }

    fn replicate(&self) -> CoreResult<Box<dyn Codelet>> {
        Ok(Box::new(Self {
            pusher: self.pusher.sibling()?,
        }))
    }
}

/// Loads the adaptor into its output sockets
#[derive(Debug)]
pub struct PullCodelet {
    puller: Puller,
}

impl Codelet for PullCodelet {
    fn exec(&mut self, io: &mut TaskIo<'_>, _frame_id: u64) -> CoreResult<Status> {
        let streams = buffers(io)?;
        stop_on_cancel(self.puller.pull(&streams), "puller", self.puller.id())
    }

    fn replicate(&self) -> CoreResult<Box<dyn Codelet>> {
        Ok(Box::new(Self {
            puller: self.puller.sibling()?,
        }))
    }
}

fn check_layouts(adaptor: &Adaptor, layouts: &[StreamLayout]) -> CoreResult<()> {
    if layouts.len() != adaptor.n_streams() {
        return Err(CoreError::config(
            "streams",
            format!(
                "adaptor carries {} streams, {} layouts given",
                adaptor.n_streams(),
                layouts.len()
            ),
        ));
    }
    Ok(())
}

fn with_sockets(
    mut task: Task,
    layouts: &[StreamLayout],
    direction: SocketDirection,
    n_frames: usize,
) -> Task {
    for layout in layouts {
        task = task.with_socket(Socket::new(
            layout.name.clone(),
            direction,
            layout.datatype,
            layout.n_elmts,
        ));
    }
    task.set_n_frames(n_frames);
    task
}

/// Task with one input socket per stream, pushing into `adaptor`
///
/// # Errors
///
/// Fails when every producer slot of the adaptor is taken or the layouts do
/// not match its streams.
pub fn push_task(
    name: impl Into<String>,
    adaptor: &Adaptor,
    layouts: &[StreamLayout],
    n_frames: usize,
) -> CoreResult<Task> {
    check_layouts(adaptor, layouts)?;
    let codelet = PushCodelet {
        pusher: adaptor.add_pusher()?,
    };
    Ok(with_sockets(
        Task::new(name, Box::new(codelet)),
        layouts,
        SocketDirection::In,
        n_frames,
    ))
}

/// Task with one output socket per stream, pulling from `adaptor`
///
/// # Errors
///
/// Fails when every consumer slot of the adaptor is taken or the layouts do
/// not match its streams.
pub fn pull_task(
    name: impl Into<String>,
    adaptor: &Adaptor,
    layouts: &[StreamLayout],
    n_frames: usize,
) -> CoreResult<Task> {
    check_layouts(adaptor, layouts)?;
    let codelet = PullCodelet {
        puller: adaptor.add_puller()?,
    };
    Ok(with_sockets(
        Task::new(name, Box::new(codelet)),
        layouts,
        SocketDirection::Out,
        n_frames,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptor::AdaptorConfig;
    use weir_core::socket::{read_u32, write_u32};

    fn layout() -> Vec<StreamLayout> {
        vec![StreamLayout {
            name: "value".to_string(),
            datatype: Datatype::UInt32,
            n_elmts: 1,
        }]
    }

    #[test]
    fn test_push_then_pull() {
        let adaptor = Adaptor::new(AdaptorConfig::default().with_buffer_size(2), vec![4], 1).unwrap();
        let mut push = push_task("push", &adaptor, &layout(), 1).unwrap();
        let mut pull = pull_task("pull", &adaptor, &layout(), 1).unwrap();
        adaptor.alloc_buffers().unwrap();

        assert_eq!(push.socket(0).unwrap().direction(), SocketDirection::In);
        assert_eq!(pull.socket(0).unwrap().direction(), SocketDirection::Out);

        write_u32(&mut push.socket(0).unwrap().buffer().lock(), 0, 42);
        assert_eq!(push.exec(0).unwrap(), Status::Success);
        assert_eq!(pull.exec(0).unwrap(), Status::Success);
        assert_eq!(read_u32(&pull.socket(0).unwrap().buffer().lock(), 0), Some(42));
    }

    #[test]
    fn test_cancel_maps_to_failure_stop() {
        let adaptor = Adaptor::new(AdaptorConfig::default(), vec![4], 1).unwrap();
        let _push = push_task("push", &adaptor, &layout(), 1).unwrap();
        let mut pull = pull_task("pull", &adaptor, &layout(), 1).unwrap();
        adaptor.alloc_buffers().unwrap();
        adaptor.cancel_waiting();
        assert_eq!(pull.exec(0).unwrap(), Status::FailureStop);
    }

    #[test]
    fn test_replicate_registers_siblings() {
        let config = AdaptorConfig::default().with_replicas(2, 1);
        let adaptor = Adaptor::new(config, vec![4], 1).unwrap();
        let push = push_task("push", &adaptor, &layout(), 1).unwrap();
        let _pull = pull_task("pull", &adaptor, &layout(), 1).unwrap();
        assert!(adaptor.alloc_buffers().is_err());
        let copy = push.replicate().unwrap();
        adaptor.alloc_buffers().unwrap();
        // no producer slot left
        assert!(copy.replicate().is_err());
    }

    #[test]
    fn test_layout_mismatch() {
        let adaptor = Adaptor::new(AdaptorConfig::default(), vec![4, 4], 1).unwrap();
        assert!(push_task("push", &adaptor, &layout(), 1).is_err());
    }

    #[test]
    fn test_sockets_follow_n_frames() {
        let adaptor = Adaptor::new(AdaptorConfig::default(), vec![4], 3).unwrap();
        let pull = pull_task("pull", &adaptor, &layout(), 3).unwrap();
        assert_eq!(pull.socket(0).unwrap().n_bytes(), 12);
        assert_eq!(StreamLayout { n_elmts: 2, ..layout()[0].clone() }.frame_bytes(), 8);
    }
}
