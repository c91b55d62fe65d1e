mod common;
mod mediatype;
mod pack_unpack;
mod reference;
mod registry;
