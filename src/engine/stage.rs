use crate::{Error, Result, engine::Opcode, resp::Command};
use bytes::BytesMut;

/// Reply shape a stage expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Expect {
    /// `:n`
    Int,
    /// bulk or simple string
    Char,
    /// `*n`
    Array,
}

/// Static description of one stage of an opcode: the RESP command template
/// with `%0`..`%N` positional markers, how many replies to consume before
/// advancing, and whether the stage produces the user-visible result and/or
/// terminates the request.
pub(crate) struct StageSpec {
    /// command verb, for logging
    pub name: &'static str,
    /// number of positional markers in the template
    pub array_len: usize,
    /// replies to consume before this stage advances
    pub resp_cnt: usize,
    pub is_final: bool,
    pub produces_result: bool,
    pub expect: Expect,
    pub template: &'static str,
}

pub(crate) const MOVE_STAGE_DUMP: usize = 0;
pub(crate) const MOVE_STAGE_RESTORE: usize = 1;
pub(crate) const MOVE_STAGE_DEL: usize = 2;

pub(crate) const DIRECTORY_STAGE_META: usize = 0;
pub(crate) const DIRECTORY_STAGE_SCAN: usize = 1;

pub(crate) const NSDETACH_STAGE_DELCHECK: usize = 0;
pub(crate) const NSDETACH_STAGE_SCAN: usize = 1;
pub(crate) const NSDETACH_STAGE_DELKEYS: usize = 2;
pub(crate) const NSDETACH_STAGE_DELNS: usize = 3;

pub(crate) const NSDELETE_STAGE_EXIST: usize = 0;
pub(crate) const NSDELETE_STAGE_SETFLAG: usize = 1;

const PUT_STAGES: &[StageSpec] = &[StageSpec {
    name: "RPUSH",
    array_len: 2,
    resp_cnt: 1,
    is_final: true,
    produces_result: true,
    expect: Expect::Int,
    template: "*3\r\n$5\r\nRPUSH\r\n%0%1",
}];

const GET_STAGES: &[StageSpec] = &[StageSpec {
    name: "LPOP",
    array_len: 1,
    resp_cnt: 1,
    is_final: true,
    produces_result: true,
    expect: Expect::Char,
    template: "*2\r\n$4\r\nLPOP\r\n%0",
}];

const READ_STAGES: &[StageSpec] = &[StageSpec {
    name: "LINDEX",
    array_len: 1,
    resp_cnt: 1,
    is_final: true,
    produces_result: true,
    expect: Expect::Char,
    template: "*3\r\n$6\r\nLINDEX\r\n%0$1\r\n0\r\n",
}];

const REMOVE_STAGES: &[StageSpec] = &[StageSpec {
    name: "DEL",
    array_len: 1,
    resp_cnt: 1,
    is_final: true,
    produces_result: true,
    expect: Expect::Int,
    template: "*2\r\n$3\r\nDEL\r\n%0",
}];

const MOVE_STAGES: &[StageSpec] = &[
    StageSpec {
        name: "DUMP",
        array_len: 1,
        resp_cnt: 1,
        is_final: false,
        produces_result: false,
        expect: Expect::Char,
        template: "*2\r\n$4\r\nDUMP\r\n%0",
    },
    StageSpec {
        name: "RESTORE",
        array_len: 2,
        resp_cnt: 1,
        is_final: false,
        produces_result: false,
        expect: Expect::Char,
        template: "*4\r\n$7\r\nRESTORE\r\n%0$1\r\n0\r\n%1",
    },
    StageSpec {
        name: "DEL",
        array_len: 1,
        resp_cnt: 1,
        is_final: true,
        produces_result: true,
        expect: Expect::Int,
        template: "*2\r\n$3\r\nDEL\r\n%0",
    },
];

const SCAN_TEMPLATE: &str = "*6\r\n$4\r\nSCAN\r\n%0$5\r\nMATCH\r\n%1$5\r\nCOUNT\r\n$4\r\n1000\r\n";

const DIRECTORY_STAGES: &[StageSpec] = &[
    StageSpec {
        name: "HGETALL",
        array_len: 1,
        resp_cnt: 1,
        is_final: false,
        produces_result: false,
        expect: Expect::Array,
        template: "*2\r\n$7\r\nHGETALL\r\n%0",
    },
    StageSpec {
        name: "SCAN",
        array_len: 2,
        resp_cnt: 1,
        is_final: true,
        produces_result: true,
        expect: Expect::Array,
        template: SCAN_TEMPLATE,
    },
];

const NSCREATE_STAGES: &[StageSpec] = &[
    StageSpec {
        name: "HSETNX",
        array_len: 3,
        resp_cnt: 1,
        is_final: false,
        produces_result: false,
        expect: Expect::Int,
        template: "*4\r\n$6\r\nHSETNX\r\n%0%1%2",
    },
    StageSpec {
        name: "HMSET",
        array_len: 7,
        resp_cnt: 1,
        is_final: true,
        produces_result: true,
        expect: Expect::Char,
        template: "*8\r\n$5\r\nHMSET\r\n%0%1%2%3%4%5%6",
    },
];

const NSATTACH_STAGES: &[StageSpec] = &[
    StageSpec {
        name: "EXISTS",
        array_len: 1,
        resp_cnt: 1,
        is_final: false,
        produces_result: false,
        expect: Expect::Int,
        template: "*2\r\n$6\r\nEXISTS\r\n%0",
    },
    StageSpec {
        name: "HINCRBY",
        array_len: 2,
        resp_cnt: 1,
        is_final: true,
        produces_result: true,
        expect: Expect::Int,
        template: "*4\r\n$7\r\nHINCRBY\r\n%0$6\r\nrefcnt\r\n%1",
    },
];

const NSDETACH_STAGES: &[StageSpec] = &[
    // MULTI/EXEC block: the four replies (OK, QUEUED, QUEUED, EXEC array)
    // arrive separately and are consumed together
    StageSpec {
        name: "MULTI",
        array_len: 2,
        resp_cnt: 4,
        is_final: false,
        produces_result: false,
        expect: Expect::Array,
        template: "*1\r\n$5\r\nMULTI\r\n*4\r\n$7\r\nHINCRBY\r\n%0$6\r\nrefcnt\r\n%1*4\r\n$5\r\nHMGET\r\n%0$6\r\nrefcnt\r\n$5\r\nflags\r\n*1\r\n$4\r\nEXEC\r\n",
    },
    StageSpec {
        name: "SCAN",
        array_len: 2,
        resp_cnt: 1,
        is_final: false,
        produces_result: false,
        expect: Expect::Array,
        template: SCAN_TEMPLATE,
    },
    StageSpec {
        name: "DEL",
        array_len: 1,
        resp_cnt: 1,
        is_final: false,
        produces_result: false,
        expect: Expect::Int,
        template: "*2\r\n$3\r\nDEL\r\n%0",
    },
    StageSpec {
        name: "DEL",
        array_len: 1,
        resp_cnt: 1,
        is_final: true,
        produces_result: true,
        expect: Expect::Int,
        template: "*2\r\n$3\r\nDEL\r\n%0",
    },
];

const NSDELETE_STAGES: &[StageSpec] = &[
    StageSpec {
        name: "HMGET",
        array_len: 1,
        resp_cnt: 1,
        is_final: false,
        produces_result: true,
        expect: Expect::Array,
        template: "*4\r\n$5\r\nHMGET\r\n%0$6\r\nrefcnt\r\n$5\r\nflags\r\n",
    },
    StageSpec {
        name: "HSET",
        array_len: 3,
        resp_cnt: 1,
        is_final: true,
        produces_result: false,
        expect: Expect::Int,
        template: "*4\r\n$4\r\nHSET\r\n%0%1%2",
    },
];

const NSQUERY_STAGES: &[StageSpec] = &[StageSpec {
    name: "HGETALL",
    array_len: 1,
    resp_cnt: 1,
    is_final: true,
    produces_result: true,
    expect: Expect::Array,
    template: "*2\r\n$7\r\nHGETALL\r\n%0",
}];

const ITERATOR_STAGES: &[StageSpec] = &[StageSpec {
    name: "SCAN",
    array_len: 2,
    resp_cnt: 1,
    is_final: true,
    produces_result: true,
    expect: Expect::Array,
    template: SCAN_TEMPLATE,
}];

pub(crate) fn stages(opcode: Opcode) -> &'static [StageSpec] {
    match opcode {
        Opcode::Put => PUT_STAGES,
        Opcode::Get => GET_STAGES,
        Opcode::Read => READ_STAGES,
        Opcode::Move => MOVE_STAGES,
        Opcode::Remove => REMOVE_STAGES,
        Opcode::Directory => DIRECTORY_STAGES,
        Opcode::NsCreate => NSCREATE_STAGES,
        Opcode::NsAttach => NSATTACH_STAGES,
        Opcode::NsDetach => NSDETACH_STAGES,
        Opcode::NsDelete => NSDELETE_STAGES,
        Opcode::NsQuery => NSQUERY_STAGES,
        Opcode::NsAddUnits | Opcode::NsRemoveUnits => &[],
        Opcode::Iterator => ITERATOR_STAGES,
    }
}

pub(crate) fn spec(opcode: Opcode, stage: usize) -> &'static StageSpec {
    &stages(opcode)[stage]
}

/// Expands a stage template: literal bytes are copied through, `%N` markers
/// become `$<len>\r\n<arg>\r\n` bulk strings.
pub(crate) fn build_command(spec: &StageSpec, args: &[&[u8]]) -> Result<Command> {
    if args.len() != spec.array_len {
        return Err(Error::Invalid);
    }

    let payload: usize = args.iter().map(|a| a.len() + 16).sum();
    let mut buffer = BytesMut::with_capacity(spec.template.len() + payload);

    let template = spec.template.as_bytes();
    let mut i = 0;
    while i < template.len() {
        if template[i] == b'%' {
            let index = (template[i + 1] - b'0') as usize;
            let arg = args.get(index).ok_or(Error::Invalid)?;
            crate::resp::put_bulk(&mut buffer, arg);
            i += 2;
        } else {
            buffer.extend_from_slice(&template[i..i + 1]);
            i += 1;
        }
    }

    Ok(Command::from_frame(spec.name, buffer.freeze()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_command() {
        let command = build_command(spec(Opcode::Put, 0), &[b"ns::k1", b"hello"]).unwrap();
        assert_eq!(
            b"*3\r\n$5\r\nRPUSH\r\n$6\r\nns::k1\r\n$5\r\nhello\r\n",
            command.bytes().as_ref()
        );
    }

    #[test]
    fn read_command_has_fixed_index() {
        let command = build_command(spec(Opcode::Read, 0), &[b"ns::k1"]).unwrap();
        assert_eq!(
            b"*3\r\n$6\r\nLINDEX\r\n$6\r\nns::k1\r\n$1\r\n0\r\n",
            command.bytes().as_ref()
        );
    }

    #[test]
    fn detach_delcheck_pipeline() {
        let spec = spec(Opcode::NsDetach, NSDETACH_STAGE_DELCHECK);
        assert_eq!(4, spec.resp_cnt);

        let command = build_command(spec, &[b"ns", b"-1"]).unwrap();
        let expected = b"*1\r\n$5\r\nMULTI\r\n\
                         *4\r\n$7\r\nHINCRBY\r\n$2\r\nns\r\n$6\r\nrefcnt\r\n$2\r\n-1\r\n\
                         *4\r\n$5\r\nHMGET\r\n$2\r\nns\r\n$6\r\nrefcnt\r\n$5\r\nflags\r\n\
                         *1\r\n$4\r\nEXEC\r\n";
        assert_eq!(&expected[..], command.bytes().as_ref());
    }

    #[test]
    fn scan_command() {
        let command =
            build_command(spec(Opcode::Directory, DIRECTORY_STAGE_SCAN), &[b"0", b"ns::*"])
                .unwrap();
        assert_eq!(
            b"*6\r\n$4\r\nSCAN\r\n$1\r\n0\r\n$5\r\nMATCH\r\n$5\r\nns::*\r\n$5\r\nCOUNT\r\n$4\r\n1000\r\n",
            command.bytes().as_ref()
        );
    }

    #[test]
    fn every_opcode_ends_on_a_final_stage() {
        for opcode in [
            Opcode::Put,
            Opcode::Get,
            Opcode::Read,
            Opcode::Move,
            Opcode::Remove,
            Opcode::Directory,
            Opcode::NsCreate,
            Opcode::NsAttach,
            Opcode::NsDetach,
            Opcode::NsDelete,
            Opcode::NsQuery,
            Opcode::Iterator,
        ] {
            let stages = stages(opcode);
            assert!(stages.last().unwrap().is_final, "{opcode} lacks a final stage");
            // every stage consumes at least one reply
            assert!(stages.iter().all(|s| s.resp_cnt >= 1));
        }
    }

    #[test]
    fn argument_count_is_enforced() {
        assert!(build_command(spec(Opcode::Put, 0), &[b"only-one"]).is_err());
    }
}
