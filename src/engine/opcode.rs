use std::fmt::{self, Display, Formatter};

/// Operation codes of the request state machine. Each opcode owns a static
/// stage table in [`stage`](crate::engine::stage).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Opcode {
    Put,
    Get,
    Read,
    Move,
    Remove,
    Directory,
    NsCreate,
    NsAttach,
    NsDetach,
    NsDelete,
    NsQuery,
    NsAddUnits,
    NsRemoveUnits,
    Iterator,
}

impl Display for Opcode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Opcode::Put => "PUT",
            Opcode::Get => "GET",
            Opcode::Read => "READ",
            Opcode::Move => "MOVE",
            Opcode::Remove => "REMOVE",
            Opcode::Directory => "DIRECTORY",
            Opcode::NsCreate => "NSCREATE",
            Opcode::NsAttach => "NSATTACH",
            Opcode::NsDetach => "NSDETACH",
            Opcode::NsDelete => "NSDELETE",
            Opcode::NsQuery => "NSQUERY",
            Opcode::NsAddUnits => "NSADDUNITS",
            Opcode::NsRemoveUnits => "NSREMOVEUNITS",
            Opcode::Iterator => "ITERATOR",
        };
        f.write_str(name)
    }
}
